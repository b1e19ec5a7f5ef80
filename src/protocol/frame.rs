//! Frame type with typed accessors, builders and the wire codec.

use bytes::Bytes;

use super::header::{read_fields, write_fields, FieldValue, HeaderField, HeaderFields};
use super::wire_format::{
    flags, pad8, peek_frame_size, Endian, FrameSize, MessageKind, PROTOCOL_VERSION,
};
use crate::buffer::ByteAccumulator;
use crate::codec::{BodyReader, BodyWriter};
use crate::error::{BusError, Result};

/// Error name sent when no handler exists for a call.
pub const UNKNOWN_METHOD_ERROR: &str = "org.freedesktop.DBus.Error.UnknownMethod";

/// A complete protocol message.
///
/// The body is kept as an opaque byte range described by the
/// `SIGNATURE` header field; use [`Frame::body_reader`] to decode it.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    endian: Endian,
    kind: MessageKind,
    flags: u8,
    version: u8,
    serial: u32,
    fields: HeaderFields,
    body: Bytes,
}

impl Frame {
    /// Create an empty frame of the given kind in native byte order.
    pub fn new(kind: MessageKind) -> Self {
        Self {
            endian: Endian::native(),
            kind,
            flags: 0,
            version: PROTOCOL_VERSION,
            serial: 0,
            fields: HeaderFields::new(),
            body: Bytes::new(),
        }
    }

    /// Build a method call.
    pub fn method_call(
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        member: &str,
    ) -> Self {
        let mut frame = Self::new(MessageKind::MethodCall);
        frame.set_field(HeaderField::Path, FieldValue::ObjectPath(path.to_owned()));
        frame.set_field(HeaderField::Member, FieldValue::Str(member.to_owned()));
        if let Some(iface) = interface {
            frame.set_field(HeaderField::Interface, FieldValue::Str(iface.to_owned()));
        }
        if let Some(dest) = destination {
            frame.set_field(HeaderField::Destination, FieldValue::Str(dest.to_owned()));
        }
        frame
    }

    /// Build a signal emission.
    pub fn signal(path: &str, interface: &str, member: &str) -> Self {
        let mut frame = Self::new(MessageKind::Signal);
        frame.flags = flags::NO_REPLY_EXPECTED;
        frame.set_field(HeaderField::Path, FieldValue::ObjectPath(path.to_owned()));
        frame.set_field(HeaderField::Interface, FieldValue::Str(interface.to_owned()));
        frame.set_field(HeaderField::Member, FieldValue::Str(member.to_owned()));
        frame
    }

    /// Build an empty successful reply to `call`.
    pub fn method_return(call: &Frame) -> Self {
        let mut frame = Self::new(MessageKind::MethodReturn);
        frame.address_reply_to(call);
        frame
    }

    /// Build an error reply to `call`, with an optional string body.
    pub fn error_reply(call: &Frame, name: &str, message: Option<&str>) -> Result<Self> {
        let mut frame = Self::new(MessageKind::Error);
        frame.address_reply_to(call);
        frame.set_field(HeaderField::ErrorName, FieldValue::Str(name.to_owned()));
        if let Some(message) = message {
            let mut w = BodyWriter::new(frame.endian);
            w.write_str(message)?;
            frame.set_body("s", w.into_bytes());
        }
        Ok(frame)
    }

    fn address_reply_to(&mut self, call: &Frame) {
        self.endian = call.endian;
        self.flags = flags::NO_REPLY_EXPECTED | flags::NO_AUTO_START;
        self.set_field(HeaderField::ReplySerial, FieldValue::U32(call.serial));
        if let Some(sender) = call.sender() {
            self.set_field(HeaderField::Destination, FieldValue::Str(sender.to_owned()));
        }
    }

    /// Builder-style body setter.
    pub fn with_body(mut self, signature: &str, body: impl Into<Bytes>) -> Self {
        self.set_body(signature, body);
        self
    }

    /// Builder-style flags setter.
    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    /// Builder-style byte order setter.
    pub fn with_endian(mut self, endian: Endian) -> Self {
        self.endian = endian;
        self
    }

    /// Replace the body and its signature. An empty signature removes
    /// the `SIGNATURE` field.
    pub fn set_body(&mut self, signature: &str, body: impl Into<Bytes>) {
        self.body = body.into();
        if signature.is_empty() {
            self.fields.remove(&HeaderField::Signature);
        } else {
            self.set_field(
                HeaderField::Signature,
                FieldValue::Signature(signature.to_owned()),
            );
        }
    }

    pub fn set_field(&mut self, field: HeaderField, value: FieldValue) {
        self.fields.insert(field, value);
    }

    pub fn remove_field(&mut self, field: HeaderField) -> Option<FieldValue> {
        self.fields.remove(&field)
    }

    #[inline]
    pub fn set_serial(&mut self, serial: u32) {
        self.serial = serial;
    }

    #[inline]
    pub fn set_flags(&mut self, flags: u8) {
        self.flags = flags;
    }

    /// Set the `SENDER` field.
    pub fn set_sender(&mut self, sender: &str) {
        self.set_field(HeaderField::Sender, FieldValue::Str(sender.to_owned()));
    }

    #[inline]
    pub fn endian(&self) -> Endian {
        self.endian
    }

    #[inline]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        self.flags
    }

    #[inline]
    pub fn version(&self) -> u8 {
        self.version
    }

    #[inline]
    pub fn serial(&self) -> u32 {
        self.serial
    }

    #[inline]
    pub fn fields(&self) -> &HeaderFields {
        &self.fields
    }

    /// Get the body as a slice.
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Get the body as Bytes (zero-copy clone).
    #[inline]
    pub fn body_bytes(&self) -> Bytes {
        self.body.clone()
    }

    /// Whether the sender wants a reply.
    #[inline]
    pub fn reply_expected(&self) -> bool {
        self.kind == MessageKind::MethodCall && !flags::has_flag(self.flags, flags::NO_REPLY_EXPECTED)
    }

    fn str_field(&self, field: HeaderField) -> Option<&str> {
        self.fields.get(&field).and_then(FieldValue::as_str)
    }

    pub fn path(&self) -> Option<&str> {
        self.str_field(HeaderField::Path)
    }

    pub fn interface(&self) -> Option<&str> {
        self.str_field(HeaderField::Interface)
    }

    pub fn member(&self) -> Option<&str> {
        self.str_field(HeaderField::Member)
    }

    pub fn error_name(&self) -> Option<&str> {
        self.str_field(HeaderField::ErrorName)
    }

    pub fn destination(&self) -> Option<&str> {
        self.str_field(HeaderField::Destination)
    }

    pub fn sender(&self) -> Option<&str> {
        self.str_field(HeaderField::Sender)
    }

    /// Body signature, empty when the body is empty.
    pub fn signature(&self) -> &str {
        self.str_field(HeaderField::Signature).unwrap_or("")
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.fields
            .get(&HeaderField::ReplySerial)
            .and_then(FieldValue::as_u32)
    }

    /// Reader over the body in this frame's byte order.
    pub fn body_reader(&self) -> BodyReader<'_> {
        BodyReader::new(self.endian, &self.body)
    }

    /// Message carried by an error reply (its first string argument).
    pub fn error_message(&self) -> Option<String> {
        if !self.signature().starts_with('s') {
            return None;
        }
        self.body_reader().read_str().ok().map(str::to_owned)
    }

    /// Check a reply: error replies become [`BusError::Remote`], and the
    /// body signature must equal `signature`.
    pub fn expect_signature(&self, signature: &str) -> Result<()> {
        if self.kind == MessageKind::Error {
            return Err(BusError::Remote {
                name: self.error_name().unwrap_or_default().to_owned(),
                message: self.error_message().unwrap_or_default(),
            });
        }
        if self.signature() != signature {
            return Err(BusError::Marshal(format!(
                "expected reply signature {signature:?}, got {:?}",
                self.signature()
            )));
        }
        Ok(())
    }

    /// Check that the header fields required by this kind are present.
    pub fn validate(&self) -> Result<()> {
        let missing = |what: &str| {
            Err(BusError::Protocol(format!(
                "{} frame without {what}",
                self.kind.as_str()
            )))
        };
        match self.kind {
            MessageKind::MethodCall => {
                if self.path().is_none() {
                    return missing("PATH");
                }
                if self.member().is_none() {
                    return missing("MEMBER");
                }
            }
            MessageKind::Signal => {
                if self.path().is_none() {
                    return missing("PATH");
                }
                if self.interface().is_none() {
                    return missing("INTERFACE");
                }
                if self.member().is_none() {
                    return missing("MEMBER");
                }
            }
            MessageKind::Error => {
                if self.error_name().is_none() {
                    return missing("ERROR_NAME");
                }
                if self.reply_serial().is_none() {
                    return missing("REPLY_SERIAL");
                }
            }
            MessageKind::MethodReturn => {
                if self.reply_serial().is_none() {
                    return missing("REPLY_SERIAL");
                }
            }
        }
        if !self.body.is_empty() && self.signature().is_empty() {
            return Err(BusError::Protocol("non-empty body without SIGNATURE".into()));
        }
        Ok(())
    }

    /// Encode to wire bytes.
    ///
    /// # Errors
    ///
    /// Fails if the body or header fields exceed the 32-bit length fields
    /// or a header field value is malformed.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body_len = u32::try_from(self.body.len()).map_err(|_| BusError::LengthOverflow)?;
        let mut w = BodyWriter::new(self.endian);
        w.write_byte(self.endian.as_byte());
        w.write_byte(self.kind.as_byte());
        w.write_byte(self.flags);
        w.write_byte(self.version);
        w.write_u32(body_len);
        w.write_u32(self.serial);
        write_fields(&mut w, &self.fields)?;
        w.pad(8);
        let mut out = w.into_bytes();
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    /// Decode one frame from the start of `data`.
    ///
    /// `data` may hold more than one frame; only the first is decoded.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let size = peek_frame_size(data)?;
        let total = size.total();
        if data.len() < total {
            return Err(BusError::TruncatedFrame {
                needed: total,
                available: data.len(),
            });
        }
        Self::decode_sized(Bytes::copy_from_slice(&data[..total]), size)
    }

    /// Decode from exactly one frame's bytes; the body is sliced out of
    /// `data` without copying.
    fn decode_sized(data: Bytes, size: FrameSize) -> Result<Self> {
        let total = size.total();
        let endian = Endian::from_byte(data[0])?;
        let kind = MessageKind::from_byte(data[1])?;
        let frame_flags = data[2];
        let version = data[3];
        let serial = endian.read_u32([data[8], data[9], data[10], data[11]]);
        if serial == 0 {
            return Err(BusError::Protocol("frame with serial 0".into()));
        }

        // the fields array starts with its length word at offset 12
        let mut r = BodyReader::with_base(endian, &data[12..size.header_size], 12);
        let fields = read_fields(&mut r).map_err(marshal_to_protocol)?;

        let frame = Self {
            endian,
            kind,
            flags: frame_flags,
            version,
            serial,
            fields,
            body: data.slice(size.header_size..total),
        };
        frame.validate()?;
        Ok(frame)
    }

    /// Total encoded size without encoding.
    pub fn encoded_len(&self) -> Result<usize> {
        let mut w = BodyWriter::with_base(self.endian, 12);
        write_fields(&mut w, &self.fields)?;
        Ok(pad8(12 + w.len()) + self.body.len())
    }
}

/// Decode the frame at the front of `acc`, consuming exactly
/// `size.total()` bytes.
///
/// # Errors
///
/// `TruncatedFrame` if `acc` holds fewer bytes than `size` declares.
pub fn decode_frame(acc: &mut ByteAccumulator, size: FrameSize) -> Result<Frame> {
    let data = acc.consume(size.total())?;
    Frame::decode_sized(data, size)
}

fn marshal_to_protocol(err: BusError) -> BusError {
    match err {
        BusError::Marshal(msg) => BusError::Protocol(msg),
        other => other,
    }
}
