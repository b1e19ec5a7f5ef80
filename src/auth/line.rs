//! CRLF line framing for the authentication exchange.

use crate::buffer::ByteAccumulator;
use crate::error::{BusError, Result};

/// Hard cap on one authentication line, excluding the CRLF.
pub const MAX_LINE_LENGTH: usize = 16384;

const CRLF: &[u8] = b"\r\n";

/// Take the next complete line from `acc`, without its terminator.
///
/// Returns `Ok(None)` when no full line is buffered yet.
///
/// # Errors
///
/// `LineTooLong` once a line (terminated or not) exceeds
/// [`MAX_LINE_LENGTH`]. The caller must treat this as fatal.
pub fn next_line(acc: &mut ByteAccumulator) -> Result<Option<String>> {
    match acc.find(CRLF) {
        Some(end) if end > MAX_LINE_LENGTH => Err(BusError::LineTooLong),
        Some(end) => {
            let line = acc.consume(end)?;
            acc.skip(CRLF.len())?;
            Ok(Some(String::from_utf8_lossy(&line).into_owned()))
        }
        // a lone trailing '\r' may still become the terminator
        None if acc.len() > MAX_LINE_LENGTH + 1 => Err(BusError::LineTooLong),
        None => Ok(None),
    }
}

/// Check the stream ended on a line boundary.
///
/// # Errors
///
/// `IncompleteLine` if unterminated bytes remain.
pub fn finish(acc: &ByteAccumulator) -> Result<()> {
    if acc.is_empty() {
        Ok(())
    } else {
        Err(BusError::IncompleteLine)
    }
}

/// Terminate `line` with CRLF.
pub fn encode_line(line: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len() + CRLF.len());
    out.extend_from_slice(line.as_bytes());
    out.extend_from_slice(CRLF);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_split() {
        let mut acc = ByteAccumulator::new();
        acc.append(b"AUTH EXTERNAL 31\r\nBEGIN\r\npartial");
        assert_eq!(next_line(&mut acc).unwrap().as_deref(), Some("AUTH EXTERNAL 31"));
        assert_eq!(next_line(&mut acc).unwrap().as_deref(), Some("BEGIN"));
        assert_eq!(next_line(&mut acc).unwrap(), None);
        assert_eq!(acc.as_slice(), b"partial");
    }

    #[test]
    fn test_bare_lf_is_not_a_terminator() {
        let mut acc = ByteAccumulator::new();
        acc.append(b"BEGIN\n");
        assert_eq!(next_line(&mut acc).unwrap(), None);
    }

    #[test]
    fn test_line_too_long_unterminated() {
        let mut acc = ByteAccumulator::new();
        acc.append(&vec![b'A'; MAX_LINE_LENGTH + 2]);
        assert!(matches!(next_line(&mut acc), Err(BusError::LineTooLong)));
    }

    #[test]
    fn test_line_too_long_terminated() {
        let mut acc = ByteAccumulator::new();
        acc.append(&vec![b'A'; MAX_LINE_LENGTH + 1]);
        acc.append(b"\r\n");
        assert!(matches!(next_line(&mut acc), Err(BusError::LineTooLong)));
    }

    #[test]
    fn test_max_length_line_accepted() {
        let mut acc = ByteAccumulator::new();
        acc.append(&vec![b'A'; MAX_LINE_LENGTH]);
        acc.append(b"\r\n");
        assert_eq!(next_line(&mut acc).unwrap().unwrap().len(), MAX_LINE_LENGTH);
    }

    #[test]
    fn test_finish_incomplete() {
        let mut acc = ByteAccumulator::new();
        assert!(finish(&acc).is_ok());
        acc.append(b"OK 12");
        assert!(matches!(finish(&acc), Err(BusError::IncompleteLine)));
    }
}
