//! Type signature parsing.
//!
//! A signature is a string of type codes. Basic codes are single bytes;
//! containers are `a<T>`, `(T...)` and `{KV}`. Signatures are limited to
//! 255 bytes and 32 levels of nesting.

use crate::error::{BusError, Result};

/// Longest valid signature.
pub const MAX_SIGNATURE_LENGTH: usize = 255;

const MAX_DEPTH: usize = 32;

/// Whether `code` names a fixed-size or string-like basic type.
pub fn is_basic(code: u8) -> bool {
    matches!(
        code,
        b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b's' | b'o' | b'g' | b'h'
    )
}

/// Alignment in bytes of a value starting with `code`.
pub fn alignment(code: u8) -> Result<usize> {
    match code {
        b'y' | b'g' | b'v' => Ok(1),
        b'n' | b'q' => Ok(2),
        b'b' | b'i' | b'u' | b'h' | b's' | b'o' | b'a' => Ok(4),
        b'x' | b't' | b'd' | b'(' | b'{' => Ok(8),
        other => Err(BusError::Marshal(format!(
            "unknown type code {:?}",
            other as char
        ))),
    }
}

/// Split off the first complete type of `sig`.
///
/// ```
/// use buswire::codec::split_first;
///
/// assert_eq!(split_first("a{sv}i").unwrap(), ("a{sv}", "i"));
/// assert_eq!(split_first("(ii)").unwrap(), ("(ii)", ""));
/// ```
pub fn split_first(sig: &str) -> Result<(&str, &str)> {
    let len = complete_type_len(sig.as_bytes(), 0, 0)?;
    Ok(sig.split_at(len))
}

/// Check that `sig` is a sequence of complete types.
pub fn validate(sig: &str) -> Result<()> {
    if sig.len() > MAX_SIGNATURE_LENGTH {
        return Err(BusError::Marshal(format!(
            "signature longer than {MAX_SIGNATURE_LENGTH} bytes"
        )));
    }
    let bytes = sig.as_bytes();
    let mut pos = 0;
    while pos < bytes.len() {
        pos += complete_type_len(bytes, pos, 0)?;
    }
    Ok(())
}

fn complete_type_len(sig: &[u8], start: usize, depth: usize) -> Result<usize> {
    if depth > MAX_DEPTH {
        return Err(BusError::Marshal("signature nested too deeply".into()));
    }
    let code = *sig
        .get(start)
        .ok_or_else(|| BusError::Marshal("signature ends inside a container".into()))?;
    match code {
        b'v' => Ok(1),
        c if is_basic(c) => Ok(1),
        b'a' => Ok(1 + complete_type_len(sig, start + 1, depth + 1)?),
        b'(' => {
            let mut pos = start + 1;
            let mut members = 0;
            loop {
                match sig.get(pos) {
                    Some(b')') if members > 0 => return Ok(pos + 1 - start),
                    Some(b')') => return Err(BusError::Marshal("empty struct".into())),
                    Some(_) => {
                        pos += complete_type_len(sig, pos, depth + 1)?;
                        members += 1;
                    }
                    None => return Err(BusError::Marshal("unterminated struct".into())),
                }
            }
        }
        b'{' => {
            let key = *sig
                .get(start + 1)
                .ok_or_else(|| BusError::Marshal("unterminated dict entry".into()))?;
            if !is_basic(key) {
                return Err(BusError::Marshal("dict entry key must be basic".into()));
            }
            let value_len = complete_type_len(sig, start + 2, depth + 1)?;
            let close = start + 2 + value_len;
            if sig.get(close) != Some(&b'}') {
                return Err(BusError::Marshal("dict entry must hold two types".into()));
            }
            Ok(close + 1 - start)
        }
        other => Err(BusError::Marshal(format!(
            "unknown type code {:?}",
            other as char
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_first_basic() {
        assert_eq!(split_first("su").unwrap(), ("s", "u"));
        assert_eq!(split_first("v").unwrap(), ("v", ""));
    }

    #[test]
    fn test_split_first_containers() {
        assert_eq!(split_first("a(yv)x").unwrap(), ("a(yv)", "x"));
        assert_eq!(split_first("aai").unwrap(), ("aai", ""));
        assert_eq!(split_first("a{s(ii)}").unwrap(), ("a{s(ii)}", ""));
    }

    #[test]
    fn test_validate_rejects_malformed() {
        assert!(validate("").is_ok());
        assert!(validate("a").is_err());
        assert!(validate("()").is_err());
        assert!(validate("(i").is_err());
        assert!(validate("{vs}").is_err());
        assert!(validate("{sii}").is_err());
        assert!(validate("z").is_err());
        assert!(validate(&format!("{}i", "a".repeat(40))).is_err());
    }

    #[test]
    fn test_alignment_table() {
        assert_eq!(alignment(b'y').unwrap(), 1);
        assert_eq!(alignment(b'b').unwrap(), 4);
        assert_eq!(alignment(b'q').unwrap(), 2);
        assert_eq!(alignment(b'd').unwrap(), 8);
        assert_eq!(alignment(b's').unwrap(), 4);
        assert_eq!(alignment(b'g').unwrap(), 1);
        assert_eq!(alignment(b'(').unwrap(), 8);
        assert_eq!(alignment(b'v').unwrap(), 1);
    }
}
