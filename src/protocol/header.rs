//! Header fields.
//!
//! Header fields are encoded as an array of `(code, variant)` structs.
//! Each known code carries a value of one fixed type; unknown codes are
//! skipped on decode so newer peers can add fields.

use std::collections::BTreeMap;

use crate::codec::{BodyReader, BodyWriter};
use crate::error::{BusError, Result};

/// Known header field codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum HeaderField {
    Path = 1,
    Interface = 2,
    Member = 3,
    ErrorName = 4,
    ReplySerial = 5,
    Destination = 6,
    Sender = 7,
    Signature = 8,
}

impl HeaderField {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => HeaderField::Path,
            2 => HeaderField::Interface,
            3 => HeaderField::Member,
            4 => HeaderField::ErrorName,
            5 => HeaderField::ReplySerial,
            6 => HeaderField::Destination,
            7 => HeaderField::Sender,
            8 => HeaderField::Signature,
            _ => return None,
        })
    }

    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Signature of the value this field must carry.
    pub fn value_signature(self) -> &'static str {
        match self {
            HeaderField::Path => "o",
            HeaderField::ReplySerial => "u",
            HeaderField::Signature => "g",
            _ => "s",
        }
    }
}

/// Value of a header field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Str(String),
    ObjectPath(String),
    Signature(String),
    U32(u32),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) | FieldValue::ObjectPath(s) | FieldValue::Signature(s) => Some(s),
            FieldValue::U32(_) => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            FieldValue::U32(v) => Some(*v),
            _ => None,
        }
    }

    fn signature(&self) -> &'static str {
        match self {
            FieldValue::Str(_) => "s",
            FieldValue::ObjectPath(_) => "o",
            FieldValue::Signature(_) => "g",
            FieldValue::U32(_) => "u",
        }
    }
}

/// Ordered field-code to value mapping; each code appears at most once.
pub type HeaderFields = BTreeMap<HeaderField, FieldValue>;

/// Write all fields as an `a(yv)` array.
pub(crate) fn write_fields(w: &mut BodyWriter, fields: &HeaderFields) -> Result<()> {
    let start = w.begin_array(8);
    for (field, value) in fields {
        if value.signature() != field.value_signature() {
            return Err(BusError::Protocol(format!(
                "header field {field:?} must be of type {}",
                field.value_signature()
            )));
        }
        w.begin_struct();
        w.write_byte(field.code());
        w.write_signature(value.signature())?;
        match value {
            FieldValue::Str(s) => w.write_str(s)?,
            FieldValue::ObjectPath(s) => w.write_object_path(s)?,
            FieldValue::Signature(s) => w.write_signature(s)?,
            FieldValue::U32(v) => w.write_u32(*v),
        }
    }
    w.end_array(start)
}

/// Read an `a(yv)` array of fields.
pub(crate) fn read_fields(r: &mut BodyReader<'_>) -> Result<HeaderFields> {
    let mut fields = HeaderFields::new();
    r.read_array(8, |r| {
        r.align(8)?;
        let code = r.read_byte()?;
        let sig = r.read_signature()?;
        let Some(field) = HeaderField::from_code(code) else {
            tracing::trace!(code, signature = sig, "skipping unknown header field");
            return r.skip(sig);
        };
        if sig != field.value_signature() {
            return Err(BusError::Protocol(format!(
                "header field {field:?} has type {sig:?}, expected {}",
                field.value_signature()
            )));
        }
        let value = match sig {
            "o" => FieldValue::ObjectPath(r.read_object_path()?.to_owned()),
            "u" => FieldValue::U32(r.read_u32()?),
            "g" => FieldValue::Signature(r.read_signature()?.to_owned()),
            _ => FieldValue::Str(r.read_str()?.to_owned()),
        };
        if fields.insert(field, value).is_some() {
            return Err(BusError::Protocol(format!(
                "duplicate header field {field:?}"
            )));
        }
        Ok(())
    })?;
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Arg;
    use crate::protocol::Endian;

    #[test]
    fn test_fields_round_trip() {
        let mut fields = HeaderFields::new();
        fields.insert(HeaderField::Path, FieldValue::ObjectPath("/a/b".into()));
        fields.insert(HeaderField::Member, FieldValue::Str("Ping".into()));
        fields.insert(HeaderField::ReplySerial, FieldValue::U32(9));
        fields.insert(HeaderField::Signature, FieldValue::Signature("su".into()));

        let mut w = BodyWriter::new(Endian::Big);
        write_fields(&mut w, &fields).unwrap();
        let bytes = w.into_bytes();
        let mut r = BodyReader::new(Endian::Big, &bytes);
        assert_eq!(read_fields(&mut r).unwrap(), fields);
        assert!(r.is_empty());
    }

    #[test]
    fn test_unknown_field_skipped() {
        let mut w = BodyWriter::new(Endian::Little);
        let start = w.begin_array(8);
        w.begin_struct();
        w.write_byte(200);
        w.write_variant(&Arg::Uint64(1)).unwrap();
        w.begin_struct();
        w.write_byte(HeaderField::Member.code());
        w.write_variant(&Arg::Str("Hi".into())).unwrap();
        w.end_array(start).unwrap();
        let bytes = w.into_bytes();

        let mut r = BodyReader::new(Endian::Little, &bytes);
        let fields = read_fields(&mut r).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[&HeaderField::Member].as_str(), Some("Hi"));
    }

    #[test]
    fn test_wrong_field_type_rejected() {
        let mut w = BodyWriter::new(Endian::Little);
        let start = w.begin_array(8);
        w.begin_struct();
        w.write_byte(HeaderField::ReplySerial.code());
        w.write_variant(&Arg::Str("nope".into())).unwrap();
        w.end_array(start).unwrap();
        let bytes = w.into_bytes();

        let mut r = BodyReader::new(Endian::Little, &bytes);
        assert!(matches!(read_fields(&mut r), Err(BusError::Protocol(_))));
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let mut w = BodyWriter::new(Endian::Little);
        let start = w.begin_array(8);
        for _ in 0..2 {
            w.begin_struct();
            w.write_byte(HeaderField::Member.code());
            w.write_variant(&Arg::Str("M".into())).unwrap();
        }
        w.end_array(start).unwrap();
        let bytes = w.into_bytes();

        let mut r = BodyReader::new(Endian::Little, &bytes);
        assert!(matches!(read_fields(&mut r), Err(BusError::Protocol(_))));
    }
}
