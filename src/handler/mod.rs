//! Handler module - exported objects and signal routing.
//!
//! Provides:
//! - [`BusObject`] - explicit method table of an exported object
//! - [`ObjectRegistry`] - path trie of exported objects, with introspection
//! - [`MatchRule`] / [`SignalRegistry`] - signal handlers keyed by rule
//!
//! # Example
//!
//! ```no_run
//! use buswire::codec::Arg;
//! use buswire::handler::{BusObject, MatchRule, Reply};
//! use buswire::ConnectionBuilder;
//!
//! # fn main() -> buswire::Result<()> {
//! let mut conn = ConnectionBuilder::new().connect("unix:path=/tmp/peer.sock")?;
//!
//! conn.register(
//!     "/org/example/Counter",
//!     BusObject::new().method("org.example.Counter", "Add", "uu", "u", |_conn, call| {
//!         let mut r = call.body_reader();
//!         let sum = r.read_u32()? + r.read_u32()?;
//!         Ok(Reply::args(call.endian(), &[Arg::Uint32(sum)])?)
//!     }),
//! )?;
//!
//! conn.add_signal_handler(
//!     MatchRule::signal("/org/example/Counter", "org.example.Counter", "Reset")?,
//!     |_conn, _signal| {
//!         println!("counter reset");
//!         Ok(())
//!     },
//! );
//! # Ok(())
//! # }
//! ```

mod object;
mod registry;
mod signal;

pub use object::{
    BusObject, Method, MethodError, MethodHandler, MethodResult, Reply, FAILED_ERROR,
    INVALID_ARGS_ERROR,
};
pub use registry::{ObjectRegistry, INTROSPECT_DOCTYPE};
pub use signal::{MatchRule, SignalHandler, SignalRegistry};
