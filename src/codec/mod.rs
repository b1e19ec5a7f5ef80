//! Codec module - body marshalling.
//!
//! Frame bodies are opaque byte ranges described by a type signature.
//! This module provides the signature-driven codec used for header
//! fields, error messages, introspection data and the bus stub:
//!
//! - [`BodyWriter`] / [`BodyReader`] - aligned, endian-aware values
//! - [`Arg`] - typed basic values
//! - signature helpers ([`split_first`], [`validate_signature`])
//!
//! # Example
//!
//! ```
//! use buswire::codec::{Arg, BodyReader, BodyWriter};
//! use buswire::protocol::Endian;
//!
//! let mut w = BodyWriter::new(Endian::Little);
//! w.write_arg(&Arg::Str("name".into())).unwrap();
//! w.write_arg(&Arg::Uint32(4)).unwrap();
//! let body = w.into_bytes();
//!
//! let mut r = BodyReader::new(Endian::Little, &body);
//! let args = r.read_args("su").unwrap();
//! assert_eq!(args, vec![Arg::Str("name".into()), Arg::Uint32(4)]);
//! ```

mod marshal;
mod signature;

pub use marshal::{Arg, ArrayStart, BodyReader, BodyWriter, MAX_ARRAY_LENGTH, MAX_VARIANT_DEPTH};
pub use signature::{
    alignment, is_basic, split_first, validate as validate_signature, MAX_SIGNATURE_LENGTH,
};
