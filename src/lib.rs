//! # buswire
//!
//! Message-bus IPC protocol stack for Unix: a binary framed
//! request/reply/signal protocol over a byte stream, preceded by a
//! line-oriented SASL handshake and driven by a single-threaded reactor.
//!
//! ## Architecture
//!
//! ```text
//! socket ─► Reactor (readable) ─► ByteAccumulator ─► FrameBuffer ─► Connection
//!                                       │                              │
//!                                 SASL handshake              replies / calls / signals
//!                               (gates the frames)                     │
//!                                                        ObjectRegistry, SignalRegistry
//! ```
//!
//! - **Frames** ([`protocol`]): 16-byte prologue, header fields, opaque body
//! - **Handshake** ([`auth`]): `AUTH` / `DATA` / `BEGIN` lines before any frame
//! - **Dispatch** ([`connection`]): serials, reply table, exported objects
//! - **Scheduling** ([`reactor`]): socket readiness, timers, cross-thread queue
//!
//! ## Example
//!
//! ```no_run
//! use buswire::codec::Arg;
//! use buswire::handler::{BusObject, Reply};
//! use buswire::protocol::Frame;
//! use buswire::ConnectionBuilder;
//!
//! # fn main() -> buswire::Result<()> {
//! let mut conn = ConnectionBuilder::new().connect("unix:path=/tmp/peer.sock")?;
//!
//! let reply = conn.send_and_await_reply(Frame::method_call(
//!     None,
//!     "/",
//!     Some("org.freedesktop.DBus.Peer"),
//!     "Ping",
//! ))?;
//! assert_eq!(reply.signature(), "");
//!
//! conn.register(
//!     "/org/example/Echo",
//!     BusObject::new().method("org.example.Echo", "Echo", "s", "s", |_conn, call| {
//!         let text = call.body_reader().read_str()?.to_owned();
//!         Ok(Reply::args(call.endian(), &[Arg::Str(text)])?)
//!     }),
//! )?;
//! conn.run()?;
//! # Ok(())
//! # }
//! ```

#[cfg(not(unix))]
compile_error!("buswire supports Unix platforms only");

pub mod auth;
pub mod buffer;
pub mod bus;
pub mod codec;
pub mod connection;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod reactor;
pub mod transport;

pub use bus::BusProxy;
pub use connection::{Connection, ConnectionBuilder, ConnectionConfig, ConnectionState};
pub use error::{BusError, Result};
pub use handler::{BusObject, MatchRule, Reply};
pub use protocol::{Frame, MessageKind};
pub use reactor::{Reactor, ReactorHandle};
