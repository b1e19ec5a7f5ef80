//! Wire format constants and prologue decoding.
//!
//! Every frame starts with a fixed 16-byte prologue:
//! ```text
//! ┌────────┬──────┬───────┬─────────┬──────────┬──────────┬──────────────┐
//! │ Endian │ Kind │ Flags │ Version │ Body len │ Serial   │ Fields len   │
//! │ 1 byte │ 1    │ 1     │ 1       │ uint32   │ uint32   │ uint32       │
//! └────────┴──────┴───────┴─────────┴──────────┴──────────┴──────────────┘
//! ```
//!
//! The three 32-bit integers use the byte order named by the first byte
//! (`l` little, `B` big). Header fields follow, padded to an 8-byte
//! boundary, then exactly `body len` bytes of body.

use crate::error::{BusError, Result};

/// Prologue size in bytes (fixed, exactly 16).
pub const PROLOGUE_SIZE: usize = 16;

/// Lowest protocol version accepted on decode.
pub const MIN_VERSION: u8 = 0;

/// Highest protocol version accepted on decode.
pub const MAX_VERSION: u8 = 1;

/// Protocol version stamped on outgoing frames.
pub const PROTOCOL_VERSION: u8 = 1;

/// Protocol maximum message size (128 MiB).
pub const MAX_MESSAGE_LENGTH: usize = 134_217_728;

/// Flag constants for the prologue flags byte.
pub mod flags {
    /// Sender does not want a reply.
    pub const NO_REPLY_EXPECTED: u8 = 0x01;
    /// Bus must not launch an owner for the destination name.
    pub const NO_AUTO_START: u8 = 0x02;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// Byte order of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

impl Endian {
    /// Byte order of the running host.
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        }
    }

    /// Parse the prologue endianness flag.
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            b'l' => Ok(Endian::Little),
            b'B' => Ok(Endian::Big),
            other => Err(BusError::InvalidEndian(other)),
        }
    }

    /// Prologue endianness flag.
    #[inline]
    pub fn as_byte(self) -> u8 {
        match self {
            Endian::Little => b'l',
            Endian::Big => b'B',
        }
    }

    #[inline]
    pub fn read_u16(self, b: [u8; 2]) -> u16 {
        match self {
            Endian::Little => u16::from_le_bytes(b),
            Endian::Big => u16::from_be_bytes(b),
        }
    }

    #[inline]
    pub fn read_u32(self, b: [u8; 4]) -> u32 {
        match self {
            Endian::Little => u32::from_le_bytes(b),
            Endian::Big => u32::from_be_bytes(b),
        }
    }

    #[inline]
    pub fn read_u64(self, b: [u8; 8]) -> u64 {
        match self {
            Endian::Little => u64::from_le_bytes(b),
            Endian::Big => u64::from_be_bytes(b),
        }
    }

    #[inline]
    pub fn u16_bytes(self, v: u16) -> [u8; 2] {
        match self {
            Endian::Little => v.to_le_bytes(),
            Endian::Big => v.to_be_bytes(),
        }
    }

    #[inline]
    pub fn u32_bytes(self, v: u32) -> [u8; 4] {
        match self {
            Endian::Little => v.to_le_bytes(),
            Endian::Big => v.to_be_bytes(),
        }
    }

    #[inline]
    pub fn u64_bytes(self, v: u64) -> [u8; 8] {
        match self {
            Endian::Little => v.to_le_bytes(),
            Endian::Big => v.to_be_bytes(),
        }
    }
}

/// Message kind carried in prologue byte 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageKind {
    /// Parse the prologue kind byte. Zero and anything above 4 are invalid.
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            1 => Ok(MessageKind::MethodCall),
            2 => Ok(MessageKind::MethodReturn),
            3 => Ok(MessageKind::Error),
            4 => Ok(MessageKind::Signal),
            other => Err(BusError::InvalidMessageKind(other)),
        }
    }

    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Name used in match rules (`type='signal'`).
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::MethodCall => "method_call",
            MessageKind::MethodReturn => "method_return",
            MessageKind::Error => "error",
            MessageKind::Signal => "signal",
        }
    }
}

/// Sizes computed from a prologue alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize {
    /// Prologue plus padded header fields.
    pub header_size: usize,
    /// Body length.
    pub body_size: usize,
}

impl FrameSize {
    /// Total bytes the frame occupies on the wire.
    #[inline]
    pub fn total(&self) -> usize {
        self.header_size + self.body_size
    }
}

/// Round `n` up to a multiple of 8.
#[inline]
pub fn pad8(n: usize) -> usize {
    align_to(n, 8)
}

/// Round `n` up to a multiple of `align` (a power of two).
#[inline]
pub fn align_to(n: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (n + align - 1) & !(align - 1)
}

/// Compute header and body sizes from the first 16 bytes of a frame.
///
/// # Errors
///
/// - `TruncatedFrame` if fewer than 16 bytes are given
/// - `InvalidEndian` if byte 0 is not `l` or `B`
/// - `ProtocolVersionUnsupported` if byte 3 is outside `[MIN_VERSION, MAX_VERSION]`
/// - `LengthOverflow` if either declared length exceeds `i32::MAX`
///
/// # Example
///
/// ```
/// use buswire::protocol::peek_frame_size;
///
/// let mut prologue = [0u8; 16];
/// prologue[..4].copy_from_slice(&[b'l', 1, 0, 1]);
/// prologue[4..8].copy_from_slice(&4u32.to_le_bytes());   // body
/// prologue[12..16].copy_from_slice(&13u32.to_le_bytes()); // fields
/// let size = peek_frame_size(&prologue).unwrap();
/// assert_eq!(size.header_size, 16 + 16);
/// assert_eq!(size.body_size, 4);
/// ```
pub fn peek_frame_size(prologue: &[u8]) -> Result<FrameSize> {
    if prologue.len() < PROLOGUE_SIZE {
        return Err(BusError::TruncatedFrame {
            needed: PROLOGUE_SIZE,
            available: prologue.len(),
        });
    }
    let endian = Endian::from_byte(prologue[0])?;
    let version = prologue[3];
    if !(MIN_VERSION..=MAX_VERSION).contains(&version) {
        return Err(BusError::ProtocolVersionUnsupported(version));
    }

    let body_len = endian.read_u32([prologue[4], prologue[5], prologue[6], prologue[7]]);
    let fields_len = endian.read_u32([prologue[12], prologue[13], prologue[14], prologue[15]]);
    if body_len > i32::MAX as u32 || fields_len > i32::MAX as u32 {
        return Err(BusError::LengthOverflow);
    }

    let header_size = PROLOGUE_SIZE
        .checked_add(pad8(fields_len as usize))
        .ok_or(BusError::LengthOverflow)?;
    let body_size = body_len as usize;
    header_size
        .checked_add(body_size)
        .ok_or(BusError::LengthOverflow)?;

    Ok(FrameSize {
        header_size,
        body_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prologue(endian: Endian, version: u8, body: u32, serial: u32, fields: u32) -> [u8; 16] {
        let mut p = [0u8; 16];
        p[0] = endian.as_byte();
        p[1] = MessageKind::MethodCall.as_byte();
        p[3] = version;
        p[4..8].copy_from_slice(&endian.u32_bytes(body));
        p[8..12].copy_from_slice(&endian.u32_bytes(serial));
        p[12..16].copy_from_slice(&endian.u32_bytes(fields));
        p
    }

    #[test]
    fn test_pad8() {
        assert_eq!(pad8(0), 0);
        assert_eq!(pad8(1), 8);
        assert_eq!(pad8(8), 8);
        assert_eq!(pad8(13), 16);
    }

    #[test]
    fn test_peek_little_endian() {
        let p = prologue(Endian::Little, 1, 100, 7, 13);
        let size = peek_frame_size(&p).unwrap();
        assert_eq!(size.header_size, 32);
        assert_eq!(size.body_size, 100);
        assert_eq!(size.total(), 132);
    }

    #[test]
    fn test_peek_big_endian() {
        let p = prologue(Endian::Big, 1, 3, 1, 8);
        let size = peek_frame_size(&p).unwrap();
        assert_eq!(size.header_size, 24);
        assert_eq!(size.body_size, 3);
    }

    #[test]
    fn test_peek_rejects_version() {
        let p = prologue(Endian::Little, 2, 0, 1, 0);
        assert!(matches!(
            peek_frame_size(&p),
            Err(BusError::ProtocolVersionUnsupported(2))
        ));
    }

    #[test]
    fn test_peek_version_zero_accepted() {
        let p = prologue(Endian::Little, 0, 0, 1, 0);
        assert!(peek_frame_size(&p).is_ok());
    }

    #[test]
    fn test_peek_rejects_overflow() {
        let p = prologue(Endian::Little, 1, u32::MAX, 1, 0);
        assert!(matches!(peek_frame_size(&p), Err(BusError::LengthOverflow)));
        let p = prologue(Endian::Big, 1, 0, 1, 0x8000_0000);
        assert!(matches!(peek_frame_size(&p), Err(BusError::LengthOverflow)));
    }

    #[test]
    fn test_peek_rejects_bad_endian() {
        let mut p = prologue(Endian::Little, 1, 0, 1, 0);
        p[0] = b'x';
        assert!(matches!(
            peek_frame_size(&p),
            Err(BusError::InvalidEndian(b'x'))
        ));
    }

    #[test]
    fn test_peek_short_input() {
        assert!(matches!(
            peek_frame_size(&[b'l', 1, 0]),
            Err(BusError::TruncatedFrame {
                needed: 16,
                available: 3
            })
        ));
    }

    #[test]
    fn test_message_kind_bytes() {
        assert_eq!(MessageKind::from_byte(4).unwrap(), MessageKind::Signal);
        assert!(matches!(
            MessageKind::from_byte(0),
            Err(BusError::InvalidMessageKind(0))
        ));
        assert_eq!(MessageKind::Error.as_str(), "error");
    }

    #[test]
    fn test_endian_helpers() {
        assert_eq!(Endian::Big.u32_bytes(1), [0, 0, 0, 1]);
        assert_eq!(Endian::Little.read_u16([1, 0]), 1);
        assert_eq!(Endian::from_byte(b'B').unwrap(), Endian::Big);
    }
}
