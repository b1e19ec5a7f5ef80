//! Transport module - byte streams under the protocol.
//!
//! Provides:
//! - [`Transport`] - the non-blocking stream a connection owns
//! - [`SockStream`] / [`SockListener`] - Unix and TCP sockets
//! - [`BusAddress`] - `unix:path=…`, `unix:abstract=…` and `tcp:…` addresses

mod address;
mod socket;
mod stream;

pub use address::{
    session_bus_address, system_bus_address, BusAddress, Endpoint, DEFAULT_SYSTEM_BUS_ADDRESS,
    SESSION_BUS_ENV, SYSTEM_BUS_ENV,
};
pub use socket::{ListenerCleanup, SockListener, SockStream};
pub use stream::{Interest, Transport};

pub(crate) use stream::{poll_timeout, wait_fd};
