//! Bus address parsing.
//!
//! An address string is a `;`-separated list of entries, each
//! `transport:key=value,key=value`. Values may carry `%XX` escapes.
//! Entries whose transport is not understood are skipped; the first usable
//! entry wins.
//!
//! # Example
//!
//! ```
//! use buswire::transport::{BusAddress, Endpoint};
//!
//! let addrs = BusAddress::parse_list("nope:x=1;unix:path=/tmp/bus,guid=abc").unwrap();
//! assert_eq!(addrs.len(), 1);
//! assert_eq!(addrs[0].guid(), Some("abc"));
//! assert!(matches!(addrs[0].endpoint(), Endpoint::Unix(p) if p.to_str() == Some("/tmp/bus")));
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::debug;

use crate::error::{BusError, Result};

/// Environment variable holding the session bus address.
pub const SESSION_BUS_ENV: &str = "DBUS_SESSION_BUS_ADDRESS";

/// Environment variable overriding the system bus address.
pub const SYSTEM_BUS_ENV: &str = "DBUS_SYSTEM_BUS_ADDRESS";

/// Well-known system bus socket.
pub const DEFAULT_SYSTEM_BUS_ADDRESS: &str = "unix:path=/var/run/dbus/system_bus_socket";

/// Where a transport connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix socket bound to a filesystem path.
    Unix(PathBuf),
    /// Linux abstract-namespace Unix socket.
    UnixAbstract(String),
    /// TCP socket.
    Tcp { host: String, port: u16 },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:path={}", escape(&path.to_string_lossy())),
            Endpoint::UnixAbstract(name) => write!(f, "unix:abstract={}", escape(name)),
            Endpoint::Tcp { host, port } => write!(f, "tcp:host={},port={port}", escape(host)),
        }
    }
}

/// One parsed address entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusAddress {
    endpoint: Endpoint,
    guid: Option<String>,
}

impl BusAddress {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            guid: None,
        }
    }

    /// Unix socket at `path`.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::new(Endpoint::Unix(path.into()))
    }

    /// Parse a `;`-separated list, keeping only entries with a known
    /// transport.
    ///
    /// # Errors
    ///
    /// `InvalidAddress` if an entry is malformed or none is usable.
    pub fn parse_list(s: &str) -> Result<Vec<Self>> {
        let mut out = Vec::new();
        for entry in s.split(';').filter(|e| !e.is_empty()) {
            if let Some(addr) = parse_entry(entry)? {
                out.push(addr);
            }
        }
        if out.is_empty() {
            return Err(BusError::InvalidAddress(format!(
                "no usable transport in {s:?}"
            )));
        }
        Ok(out)
    }

    #[inline]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Server GUID the address expects, if given.
    pub fn guid(&self) -> Option<&str> {
        self.guid.as_deref()
    }
}

impl FromStr for BusAddress {
    type Err = BusError;

    /// First usable entry of an address list.
    fn from_str(s: &str) -> Result<Self> {
        let mut list = Self::parse_list(s)?;
        Ok(list.swap_remove(0))
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.endpoint)?;
        if let Some(guid) = &self.guid {
            write!(f, ",guid={guid}")?;
        }
        Ok(())
    }
}

fn parse_entry(entry: &str) -> Result<Option<BusAddress>> {
    let (transport, rest) = entry
        .split_once(':')
        .ok_or_else(|| BusError::InvalidAddress(format!("missing transport in {entry:?}")))?;

    let mut path = None;
    let mut abstract_name = None;
    let mut host = None;
    let mut port = None;
    let mut guid = None;

    for pair in rest.split(',').filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| BusError::InvalidAddress(format!("missing '=' in {pair:?}")))?;
        let value = unescape(value)?;
        match key {
            "path" => path = Some(value),
            "abstract" => abstract_name = Some(value),
            "host" => host = Some(value),
            "port" => port = Some(value),
            "guid" => guid = Some(value),
            _ => debug!(key, "ignoring unknown address key"),
        }
    }

    let endpoint = match transport {
        "unix" => match (path, abstract_name) {
            (Some(p), None) => Endpoint::Unix(PathBuf::from(p)),
            (None, Some(a)) => Endpoint::UnixAbstract(a),
            _ => {
                return Err(BusError::InvalidAddress(format!(
                    "unix address needs exactly one of path or abstract: {entry:?}"
                )))
            }
        },
        "tcp" => {
            let port = port
                .ok_or_else(|| BusError::InvalidAddress(format!("tcp address lacks port: {entry:?}")))?;
            let port = port
                .parse::<u16>()
                .map_err(|_| BusError::InvalidAddress(format!("bad tcp port {port:?}")))?;
            Endpoint::Tcp {
                host: host.unwrap_or_else(|| "localhost".to_owned()),
                port,
            }
        }
        other => {
            debug!(transport = other, "skipping unsupported transport");
            return Ok(None);
        }
    };

    Ok(Some(BusAddress { endpoint, guid }))
}

fn unescape(value: &str) -> Result<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .ok_or_else(|| BusError::InvalidAddress(format!("truncated escape in {value:?}")))?;
            let decoded = hex::decode(hex)
                .map_err(|_| BusError::InvalidAddress(format!("bad escape in {value:?}")))?;
            out.extend(decoded);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| BusError::InvalidAddress(format!("non-UTF-8 value {value:?}")))
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        if b.is_ascii_alphanumeric() || b"-_/.\\*".contains(&b) {
            out.push(b as char);
        } else {
            out.push('%');
            out.push_str(&hex::encode([b]));
        }
    }
    out
}

/// Address of the session bus, from the environment.
///
/// # Errors
///
/// `InvalidAddress` if the variable is unset.
pub fn session_bus_address() -> Result<String> {
    std::env::var(SESSION_BUS_ENV)
        .map_err(|_| BusError::InvalidAddress(format!("{SESSION_BUS_ENV} is not set")))
}

/// Address of the system bus: the environment override, or the
/// well-known socket.
pub fn system_bus_address() -> String {
    std::env::var(SYSTEM_BUS_ENV).unwrap_or_else(|_| DEFAULT_SYSTEM_BUS_ADDRESS.to_owned())
}
