//! Frame buffer for accumulating partial reads.
//!
//! Wraps a [`ByteAccumulator`] and extracts every complete frame it holds:
//! - fewer than 16 bytes buffered: wait for the prologue
//! - prologue present: size the frame, wait until all of it is buffered
//!
//! Decoded frames hold their bodies as slices of the buffer they arrived
//! in, so only the unconsumed tail stays buffered. Feeding one byte at a
//! time yields the same frames as feeding everything at once.
//!
//! # Example
//!
//! ```
//! use buswire::protocol::{Frame, FrameBuffer};
//!
//! let mut call = Frame::method_call(None, "/a", None, "Ping");
//! call.set_serial(1);
//! let bytes = call.encode().unwrap();
//!
//! let mut buffer = FrameBuffer::new();
//! let first = buffer.push(&bytes[..10]).unwrap();
//! assert!(first.frames.is_empty());
//! assert_eq!(first.hint, 6);
//!
//! let rest = buffer.push(&bytes[10..]).unwrap();
//! assert_eq!(rest.frames.len(), 1);
//! assert_eq!(rest.hint, 16);
//! ```

use super::frame::decode_frame;
use super::wire_format::{peek_frame_size, MAX_MESSAGE_LENGTH, PROLOGUE_SIZE};
use super::Frame;
use crate::buffer::ByteAccumulator;
use crate::error::{BusError, Result};

/// Frames extracted by one [`FrameBuffer::push`].
#[derive(Debug, Default)]
pub struct Reassembled {
    /// Complete frames, in arrival order.
    pub frames: Vec<Frame>,
    /// Bytes still needed before the next frame can be decoded.
    pub hint: usize,
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
#[derive(Debug)]
pub struct FrameBuffer {
    acc: ByteAccumulator,
    max_frame_size: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    /// Create a new frame buffer with the protocol maximum frame size.
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_MESSAGE_LENGTH)
    }

    /// Create a new frame buffer with a custom maximum frame size.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self::with_accumulator(ByteAccumulator::new(), max_frame_size)
    }

    /// Continue from bytes already buffered, e.g. whatever followed the
    /// final authentication line.
    pub fn with_accumulator(acc: ByteAccumulator, max_frame_size: usize) -> Self {
        Self {
            acc,
            max_frame_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// # Errors
    ///
    /// Any prologue or frame decode error, or `FrameTooLarge` if a
    /// declared frame exceeds the configured maximum. Errors are fatal
    /// for the stream.
    pub fn push(&mut self, data: &[u8]) -> Result<Reassembled> {
        self.acc.append(data);
        self.drain()
    }

    /// Extract all complete frames already buffered.
    pub fn drain(&mut self) -> Result<Reassembled> {
        let mut out = Reassembled::default();
        self.extract_into(&mut out)?;
        Ok(out)
    }

    fn extract_into(&mut self, out: &mut Reassembled) -> Result<()> {
        loop {
            let buffered = self.acc.len();
            if buffered < PROLOGUE_SIZE {
                out.hint = PROLOGUE_SIZE - buffered;
                return Ok(());
            }
            let size = peek_frame_size(self.acc.peek(PROLOGUE_SIZE)?)?;
            let total = size.total();
            if total > self.max_frame_size {
                return Err(BusError::FrameTooLarge {
                    size: total,
                    max: self.max_frame_size,
                });
            }
            if buffered < total {
                out.hint = total - buffered;
                return Ok(());
            }
            let frame = decode_frame(&mut self.acc, size)?;
            tracing::trace!(
                serial = frame.serial(),
                kind = frame.kind().as_str(),
                len = total,
                "decoded frame"
            );
            out.frames.push(frame);
        }
    }

    /// Underlying accumulator.
    pub fn accumulator(&self) -> &ByteAccumulator {
        &self.acc
    }

    /// Mutable access to the underlying accumulator.
    pub fn accumulator_mut(&mut self) -> &mut ByteAccumulator {
        &mut self.acc
    }

    #[inline]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.acc.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.acc.is_empty()
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.acc.clear();
    }
}
