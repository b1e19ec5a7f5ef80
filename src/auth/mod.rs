//! Auth module - the line-oriented handshake that precedes the binary
//! protocol.
//!
//! Both roles read lines out of the same [`ByteAccumulator`] that later
//! feeds frame reassembly, so bytes pipelined after `BEGIN` are never lost.
//!
//! - [`SaslClient`] - initiator offering an `EXTERNAL` credential
//! - [`SaslServer`] - responder with a pluggable [`Mechanism`] table
//! - [`External`], [`Anonymous`] - built-in mechanisms
//!
//! # Example
//!
//! ```
//! use buswire::auth::{Anonymous, SaslClient, SaslServer};
//! use buswire::buffer::ByteAccumulator;
//!
//! let mut client = SaslClient::new("1000");
//! let mut server = SaslServer::new("f00d").with_mechanism(Anonymous)
//!     .with_mechanism(buswire::auth::External::for_uid(1000));
//!
//! let mut to_server = ByteAccumulator::new();
//! let mut to_client = ByteAccumulator::new();
//!
//! to_server.append(&client.start());
//! to_client.append(&server.feed(&mut to_server).unwrap());
//! to_server.append(&client.feed(&mut to_client).unwrap());
//! server.feed(&mut to_server).unwrap();
//!
//! assert!(server.is_authenticated());
//! assert_eq!(client.guid(), Some("f00d"));
//! ```
//!
//! [`ByteAccumulator`]: crate::buffer::ByteAccumulator

mod client;
mod line;
mod mechanism;
mod server;

pub use client::{ClientState, SaslClient};
pub use line::{encode_line, finish as finish_lines, next_line, MAX_LINE_LENGTH};
pub use mechanism::{Anonymous, AuthContext, External, MechResponse, Mechanism};
pub use server::{SaslServer, ServerState};
