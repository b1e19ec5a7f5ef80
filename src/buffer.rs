//! Growable byte accumulator.
//!
//! Readers append whatever the socket delivered, then peek and consume
//! complete units (SASL lines, wire frames) from the front. Backed by
//! `bytes::BytesMut`: consuming splits the front off as a frozen `Bytes`
//! without copying, and the storage reclaims consumed space on its next
//! reservation.
//!
//! The accumulator never truncates on its own. Callers bound line and
//! frame sizes before appending more.
//!
//! # Example
//!
//! ```
//! use buswire::buffer::ByteAccumulator;
//!
//! let mut acc = ByteAccumulator::new();
//! acc.append(b"OK 1234\r\nrest");
//! let end = acc.find(b"\r\n").unwrap();
//! let line = acc.consume(end + 2).unwrap();
//! assert_eq!(&line[..], b"OK 1234\r\n");
//! assert_eq!(acc.peek(4).unwrap(), b"rest");
//! ```

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{BusError, Result};

/// Byte buffer consumed from the front.
#[derive(Debug, Default, Clone)]
pub struct ByteAccumulator {
    storage: BytesMut,
}

impl ByteAccumulator {
    /// Create an empty accumulator. No memory is allocated until the
    /// first append.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an accumulator with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: BytesMut::with_capacity(capacity),
        }
    }

    /// Append bytes at the tail.
    pub fn append(&mut self, data: &[u8]) {
        self.storage.extend_from_slice(data);
    }

    /// Borrow the first `n` unconsumed bytes without consuming them.
    pub fn peek(&self, n: usize) -> Result<&[u8]> {
        self.check_available(n)?;
        Ok(&self.storage[..n])
    }

    /// Remove and return the first `n` unconsumed bytes. The returned
    /// `Bytes` shares the accumulator's allocation.
    pub fn consume(&mut self, n: usize) -> Result<Bytes> {
        self.check_available(n)?;
        Ok(self.storage.split_to(n).freeze())
    }

    /// Drop the first `n` unconsumed bytes.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.check_available(n)?;
        self.storage.advance(n);
        Ok(())
    }

    /// Offset (relative to the unconsumed data) of the first occurrence
    /// of `delimiter`, if any.
    pub fn find(&self, delimiter: &[u8]) -> Option<usize> {
        if delimiter.is_empty() {
            return Some(0);
        }
        self.as_slice()
            .windows(delimiter.len())
            .position(|w| w == delimiter)
    }

    /// All unconsumed bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage
    }

    /// Number of unconsumed bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Whether no unconsumed bytes remain.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Space available without reallocating.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.capacity()
    }

    /// Discard everything.
    pub fn clear(&mut self) {
        self.storage.clear();
    }

    fn check_available(&self, n: usize) -> Result<()> {
        let available = self.len();
        if available < n {
            return Err(BusError::TruncatedFrame {
                needed: n,
                available,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_peek() {
        let mut acc = ByteAccumulator::new();
        acc.append(b"hello");
        acc.append(b" world");
        assert_eq!(acc.len(), 11);
        assert_eq!(acc.peek(5).unwrap(), b"hello");
        // peek does not consume
        assert_eq!(acc.len(), 11);
    }

    #[test]
    fn test_consume_advances() {
        let mut acc = ByteAccumulator::new();
        acc.append(b"abcdef");
        let head = acc.consume(2).unwrap();
        assert_eq!(&head[..], b"ab");
        assert_eq!(acc.as_slice(), b"cdef");
    }

    #[test]
    fn test_short_peek_and_consume_fail() {
        let mut acc = ByteAccumulator::new();
        acc.append(b"abc");
        assert!(matches!(
            acc.peek(4),
            Err(BusError::TruncatedFrame {
                needed: 4,
                available: 3
            })
        ));
        assert!(acc.consume(4).is_err());
        // failed consume leaves data intact
        assert_eq!(acc.len(), 3);
    }

    #[test]
    fn test_find_delimiter() {
        let mut acc = ByteAccumulator::new();
        acc.append(b"AUTH EXTERNAL\r\nBEGIN\r\n");
        assert_eq!(acc.find(b"\r\n"), Some(13));
        acc.skip(15).unwrap();
        assert_eq!(acc.find(b"\r\n"), Some(5));
        assert_eq!(acc.find(b"xyz"), None);
    }

    #[test]
    fn test_find_across_appends() {
        let mut acc = ByteAccumulator::new();
        acc.append(b"OK abc\r");
        assert_eq!(acc.find(b"\r\n"), None);
        acc.append(b"\n");
        assert_eq!(acc.find(b"\r\n"), Some(6));
    }

    #[test]
    fn test_consumed_bytes_outlive_later_appends() {
        let mut acc = ByteAccumulator::with_capacity(16);
        assert!(acc.capacity() >= 16);
        acc.append(b"0123456789");
        let front = acc.consume(7).unwrap();
        acc.append(&[b'x'; 1000]);
        assert_eq!(&front[..], b"0123456");
        assert_eq!(acc.len(), 1003);
        assert_eq!(acc.peek(4).unwrap(), b"789x");
        acc.skip(1003).unwrap();
        assert!(acc.is_empty());
    }
}
