//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary protocol:
//! - 16-byte prologue sizing ([`peek_frame_size`])
//! - header fields and the [`Frame`] codec
//! - [`FrameBuffer`] reassembly of partial reads
//! - [`ObjectPath`] validation

mod frame;
mod frame_buffer;
mod header;
mod path;
mod wire_format;

pub use frame::{decode_frame, Frame, UNKNOWN_METHOD_ERROR};
pub use frame_buffer::{FrameBuffer, Reassembled};
pub use header::{FieldValue, HeaderField, HeaderFields};
pub use path::ObjectPath;
pub use wire_format::{
    align_to, flags, pad8, peek_frame_size, Endian, FrameSize, MessageKind, MAX_MESSAGE_LENGTH,
    MAX_VERSION, MIN_VERSION, PROLOGUE_SIZE, PROTOCOL_VERSION,
};
