//! Client stub for the message-bus daemon.
//!
//! Each method serialises its arguments, blocks in
//! [`Connection::send_and_await_reply`] and checks the reply signature.

use crate::codec::BodyWriter;
use crate::connection::Connection;
use crate::error::{BusError, Result};
use crate::handler::MatchRule;
use crate::protocol::{Endian, Frame};

/// Well-known name of the bus daemon.
pub const BUS_NAME: &str = "org.freedesktop.DBus";

/// Object path of the bus daemon.
pub const BUS_PATH: &str = "/org/freedesktop/DBus";

/// Interface of the bus daemon.
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";

/// Flags for [`BusProxy::request_name`].
pub mod name_flags {
    pub const ALLOW_REPLACEMENT: u32 = 0x1;
    pub const REPLACE_EXISTING: u32 = 0x2;
    pub const DO_NOT_QUEUE: u32 = 0x4;
}

/// Outcome of `RequestName`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestNameReply {
    PrimaryOwner,
    InQueue,
    Exists,
    AlreadyOwner,
}

impl TryFrom<u32> for RequestNameReply {
    type Error = BusError;

    fn try_from(code: u32) -> Result<Self> {
        match code {
            1 => Ok(Self::PrimaryOwner),
            2 => Ok(Self::InQueue),
            3 => Ok(Self::Exists),
            4 => Ok(Self::AlreadyOwner),
            other => Err(BusError::Protocol(format!(
                "unknown RequestName reply {other}"
            ))),
        }
    }
}

/// Outcome of `ReleaseName`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseNameReply {
    Released,
    NonExistent,
    NotOwner,
}

impl TryFrom<u32> for ReleaseNameReply {
    type Error = BusError;

    fn try_from(code: u32) -> Result<Self> {
        match code {
            1 => Ok(Self::Released),
            2 => Ok(Self::NonExistent),
            3 => Ok(Self::NotOwner),
            other => Err(BusError::Protocol(format!(
                "unknown ReleaseName reply {other}"
            ))),
        }
    }
}

/// Calls on the bus daemon over a borrowed connection.
///
/// # Example
///
/// ```no_run
/// use buswire::bus::{name_flags, BusProxy, RequestNameReply};
/// use buswire::ConnectionBuilder;
///
/// # fn main() -> buswire::Result<()> {
/// let mut conn = ConnectionBuilder::new().connect("unix:path=/run/user/1000/bus")?;
/// let mut bus = BusProxy::new(&mut conn);
/// bus.hello()?;
/// let reply = bus.request_name("org.example.Service", name_flags::DO_NOT_QUEUE)?;
/// assert_eq!(reply, RequestNameReply::PrimaryOwner);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct BusProxy<'a> {
    conn: &'a mut Connection,
}

impl<'a> BusProxy<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    fn call(&mut self, member: &str, args: Option<(&str, BodyWriter)>, reply_sig: &str) -> Result<Frame> {
        let mut frame = Frame::method_call(Some(BUS_NAME), BUS_PATH, Some(BUS_INTERFACE), member);
        if let Some((signature, body)) = args {
            frame.set_body(signature, body.into_bytes());
        }
        let reply = self.conn.send_and_await_reply(frame)?;
        reply.expect_signature(reply_sig)?;
        Ok(reply)
    }

    fn str_arg(s: &str) -> Result<BodyWriter> {
        let mut w = BodyWriter::new(Endian::native());
        w.write_str(s)?;
        Ok(w)
    }

    /// Register with the daemon, recording the assigned unique name on the
    /// connection.
    pub fn hello(&mut self) -> Result<String> {
        let reply = self.call("Hello", None, "s")?;
        let name = reply.body_reader().read_str()?.to_owned();
        tracing::debug!(unique_name = %name, "registered with bus");
        self.conn.set_unique_name(name.clone());
        Ok(name)
    }

    pub fn request_name(&mut self, name: &str, flags: u32) -> Result<RequestNameReply> {
        let mut w = Self::str_arg(name)?;
        w.write_u32(flags);
        let reply = self.call("RequestName", Some(("su", w)), "u")?;
        RequestNameReply::try_from(reply.body_reader().read_u32()?)
    }

    pub fn release_name(&mut self, name: &str) -> Result<ReleaseNameReply> {
        let w = Self::str_arg(name)?;
        let reply = self.call("ReleaseName", Some(("s", w)), "u")?;
        ReleaseNameReply::try_from(reply.body_reader().read_u32()?)
    }

    pub fn name_has_owner(&mut self, name: &str) -> Result<bool> {
        let w = Self::str_arg(name)?;
        let reply = self.call("NameHasOwner", Some(("s", w)), "b")?;
        reply.body_reader().read_bool()
    }

    /// Ask the daemon to route signals matching `rule` here.
    pub fn add_match(&mut self, rule: &MatchRule) -> Result<()> {
        let w = Self::str_arg(&rule.to_string())?;
        self.call("AddMatch", Some(("s", w)), "")?;
        Ok(())
    }

    pub fn remove_match(&mut self, rule: &MatchRule) -> Result<()> {
        let w = Self::str_arg(&rule.to_string())?;
        self.call("RemoveMatch", Some(("s", w)), "")?;
        Ok(())
    }

    /// Uid of the process owning `name`.
    pub fn get_unix_user(&mut self, name: &str) -> Result<u32> {
        let w = Self::str_arg(name)?;
        let reply = self.call("GetConnectionUnixUser", Some(("s", w)), "u")?;
        reply.body_reader().read_u32()
    }
}
