//! Error types for buswire.

use thiserror::Error;

/// Main error type for all bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Fewer bytes were available than the frame declares.
    #[error("Truncated frame: need {needed} bytes, have {available}")]
    TruncatedFrame { needed: usize, available: usize },

    /// Prologue carries a protocol version outside the supported range.
    #[error("Protocol version {0} is not supported")]
    ProtocolVersionUnsupported(u8),

    /// Declared body or header-field length exceeds the addressable limit.
    #[error("Declared frame length does not fit in memory")]
    LengthOverflow,

    /// First prologue byte is neither `l` nor `B`.
    #[error("Invalid endianness flag: {0:#04x}")]
    InvalidEndian(u8),

    /// Frame exceeds the configured maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Message kind byte is not one of call, return, error, signal.
    #[error("Invalid message kind: {0}")]
    InvalidMessageKind(u8),

    /// Malformed frame contents.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Body marshalling error.
    #[error("Marshal error: {0}")]
    Marshal(String),

    /// SASL line exceeded the hard line-length cap.
    #[error("Authentication line too long")]
    LineTooLong,

    /// Stream ended in the middle of a SASL line.
    #[error("Incomplete authentication line")]
    IncompleteLine,

    /// Peer refused the credential we offered.
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// Peer aborted the handshake without authenticating.
    #[error("Authentication failed")]
    AuthFailed,

    /// Operation requires a fully authenticated connection.
    #[error("Connection is not authenticated")]
    NotAuthenticated,

    /// No object exported at the given path.
    #[error("No object registered at {0}")]
    NotRegistered(String),

    /// String is not a valid object path.
    #[error("Invalid object path: {0:?}")]
    InvalidObjectPath(String),

    /// Remote peer answered a call with an error reply.
    #[error("{name}: {message}")]
    Remote { name: String, message: String },

    /// No reply arrived within the configured reply timeout.
    #[error("Timed out waiting for reply")]
    Timeout,

    /// Bus address could not be parsed or has no usable transport.
    #[error("Invalid bus address: {0}")]
    InvalidAddress(String),

    /// Connection closed (EOF or explicit close).
    #[error("Connection closed")]
    ConnectionClosed,
}

impl BusError {
    /// Whether this error forces the connection to close.
    ///
    /// Dispatch-level errors (remote error replies, registry misses,
    /// timeouts) leave the connection usable.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            BusError::Remote { .. }
                | BusError::NotRegistered(_)
                | BusError::InvalidObjectPath(_)
                | BusError::Timeout
                | BusError::Marshal(_)
        )
    }

    /// Copy of this error suitable for latching.
    ///
    /// `std::io::Error` is not `Clone`, so I/O errors keep their kind and
    /// message only.
    pub(crate) fn latched_copy(&self) -> BusError {
        match self {
            BusError::Io(e) => BusError::Io(std::io::Error::new(e.kind(), e.to_string())),
            BusError::TruncatedFrame { needed, available } => BusError::TruncatedFrame {
                needed: *needed,
                available: *available,
            },
            BusError::ProtocolVersionUnsupported(v) => BusError::ProtocolVersionUnsupported(*v),
            BusError::LengthOverflow => BusError::LengthOverflow,
            BusError::InvalidEndian(b) => BusError::InvalidEndian(*b),
            BusError::FrameTooLarge { size, max } => BusError::FrameTooLarge {
                size: *size,
                max: *max,
            },
            BusError::InvalidMessageKind(k) => BusError::InvalidMessageKind(*k),
            BusError::Protocol(s) => BusError::Protocol(s.clone()),
            BusError::Marshal(s) => BusError::Marshal(s.clone()),
            BusError::LineTooLong => BusError::LineTooLong,
            BusError::IncompleteLine => BusError::IncompleteLine,
            BusError::AuthRejected(s) => BusError::AuthRejected(s.clone()),
            BusError::AuthFailed => BusError::AuthFailed,
            BusError::NotAuthenticated => BusError::NotAuthenticated,
            BusError::NotRegistered(s) => BusError::NotRegistered(s.clone()),
            BusError::InvalidObjectPath(s) => BusError::InvalidObjectPath(s.clone()),
            BusError::Remote { name, message } => BusError::Remote {
                name: name.clone(),
                message: message.clone(),
            },
            BusError::Timeout => BusError::Timeout,
            BusError::InvalidAddress(s) => BusError::InvalidAddress(s.clone()),
            BusError::ConnectionClosed => BusError::ConnectionClosed,
        }
    }
}

/// Result type alias using BusError.
pub type Result<T> = std::result::Result<T, BusError>;
