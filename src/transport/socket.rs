//! Socket streams and listeners.
//!
//! [`SockStream`] wraps a non-blocking Unix or TCP socket with half-close
//! bookkeeping:
//! - `no_read` / `no_write` shut down one direction
//! - once both directions are withdrawn the stream closes itself
//! - the first I/O error is latched and forces a close
//! - close listeners run exactly once
//!
//! # Example
//!
//! ```ignore
//! use buswire::transport::{BusAddress, SockListener, SockStream};
//!
//! let listener = SockListener::bind(&BusAddress::unix("/tmp/peer.sock"))?;
//! let client = SockStream::connect(&listener.local_address())?;
//! let server = listener.accept()?;
//! ```

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, warn};

use super::address::{BusAddress, Endpoint};
use super::stream::{wait_fd, Interest, Transport};
use crate::error::{BusError, Result};

type CloseListener = Box<dyn FnOnce() + Send>;

#[derive(Debug)]
enum Socket {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Socket::Unix(s) => s.read(buf),
            Socket::Tcp(s) => s.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Socket::Unix(s) => s.write(buf),
            Socket::Tcp(s) => s.write(buf),
        }
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match self {
            Socket::Unix(s) => s.shutdown(how),
            Socket::Tcp(s) => s.shutdown(how),
        }
    }
}

impl AsFd for Socket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Socket::Unix(s) => s.as_fd(),
            Socket::Tcp(s) => s.as_fd(),
        }
    }
}

/// Non-blocking socket stream.
pub struct SockStream {
    socket: Option<Socket>,
    reading: bool,
    writing: bool,
    error: Option<BusError>,
    close_listeners: Vec<CloseListener>,
}

impl fmt::Debug for SockStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SockStream")
            .field("socket", &self.socket)
            .field("reading", &self.reading)
            .field("writing", &self.writing)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl SockStream {
    fn from_socket(socket: Socket) -> Self {
        Self {
            socket: Some(socket),
            reading: true,
            writing: true,
            error: None,
            close_listeners: Vec::new(),
        }
    }

    /// Connect to `address`.
    pub fn connect(address: &BusAddress) -> Result<Self> {
        debug!(%address, "connecting");
        match address.endpoint() {
            Endpoint::Unix(path) => Self::from_unix(UnixStream::connect(path)?),
            Endpoint::UnixAbstract(name) => Self::from_unix(connect_abstract(name)?),
            Endpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))?;
                stream.set_nodelay(true)?;
                Self::from_tcp(stream)
            }
        }
    }

    /// Adopt a connected Unix socket, switching it to non-blocking mode.
    pub fn from_unix(stream: UnixStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::from_socket(Socket::Unix(stream)))
    }

    /// Adopt a connected TCP socket, switching it to non-blocking mode.
    pub fn from_tcp(stream: TcpStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::from_socket(Socket::Tcp(stream)))
    }

    /// Two connected streams.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::from_unix(a)?, Self::from_unix(b)?))
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        self.reading
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.writing
    }

    /// The first error recorded on this stream.
    pub fn error(&self) -> Option<&BusError> {
        self.error.as_ref()
    }

    /// User id of the peer process (Unix sockets on Linux only).
    #[cfg(target_os = "linux")]
    pub fn peer_uid(&self) -> Option<u32> {
        use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
        match &self.socket {
            Some(Socket::Unix(s)) => getsockopt(s, PeerCredentials).ok().map(|c| c.uid()),
            _ => None,
        }
    }

    /// Stop reading. Closes the stream if writing was already withdrawn.
    pub fn no_read(&mut self) {
        if self.reading {
            self.reading = false;
            self.shutdown(Shutdown::Read);
        }
        self.close_if_idle();
    }

    /// Stop writing. Closes the stream if reading was already withdrawn.
    pub fn no_write(&mut self) {
        if self.writing {
            self.writing = false;
            self.shutdown(Shutdown::Write);
        }
        self.close_if_idle();
    }

    /// Run `listener` once when the stream closes; immediately if it
    /// already has.
    pub fn on_close(&mut self, listener: impl FnOnce() + Send + 'static) {
        if self.socket.is_none() {
            listener();
        } else {
            self.close_listeners.push(Box::new(listener));
        }
    }

    /// Record `err` if it is the first one, then close.
    pub fn fail(&mut self, err: &BusError) {
        if self.error.is_none() {
            warn!(error = %err, "stream failed");
            self.error = Some(err.latched_copy());
        }
        Transport::close(self);
    }

    fn shutdown(&self, how: Shutdown) {
        if let Some(socket) = &self.socket {
            if let Err(e) = socket.shutdown(how) {
                debug!(?how, error = %e, "shutdown failed");
            }
        }
    }

    fn close_if_idle(&mut self) {
        if !self.reading && !self.writing {
            Transport::close(self);
        }
    }

    fn latch_io(&mut self, e: io::Error) -> io::Error {
        if matches!(
            e.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
        ) {
            return e;
        }
        let copy = io::Error::new(e.kind(), e.to_string());
        self.fail(&BusError::Io(e));
        copy
    }
}

impl Transport for SockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.reading {
            return Ok(0);
        }
        let Some(socket) = self.socket.as_mut() else {
            return Ok(0);
        };
        match socket.read(buf) {
            Ok(0) if !buf.is_empty() => {
                debug!("peer closed the stream");
                Transport::close(self);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => Err(self.latch_io(e)),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let socket = match self.socket.as_mut() {
            Some(s) if self.writing => s,
            _ => return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream not writable")),
        };
        socket.write(buf).map_err(|e| self.latch_io(e))
    }

    fn wait(&mut self, interest: Interest, timeout: Option<Duration>) -> io::Result<bool> {
        match &self.socket {
            Some(socket) => wait_fd(socket, interest, timeout),
            None => Ok(true),
        }
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(|s| s.as_fd().as_raw_fd())
    }

    fn close(&mut self) {
        let Some(socket) = self.socket.take() else {
            return;
        };
        self.reading = false;
        self.writing = false;
        drop(socket);
        debug!("stream closed");
        for listener in self.close_listeners.drain(..) {
            listener();
        }
    }

    fn is_open(&self) -> bool {
        self.socket.is_some()
    }
}

impl Drop for SockStream {
    fn drop(&mut self) {
        Transport::close(self);
    }
}

// ============================================================================
// Abstract namespace
// ============================================================================

#[cfg(target_os = "linux")]
fn connect_abstract(name: &str) -> Result<UnixStream> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
    Ok(UnixStream::connect_addr(&addr)?)
}

#[cfg(not(target_os = "linux"))]
fn connect_abstract(name: &str) -> Result<UnixStream> {
    Err(BusError::InvalidAddress(format!(
        "abstract sockets are not supported on this platform: {name}"
    )))
}

#[cfg(target_os = "linux")]
fn bind_abstract(name: &str) -> Result<UnixListener> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
    Ok(UnixListener::bind_addr(&addr)?)
}

#[cfg(not(target_os = "linux"))]
fn bind_abstract(name: &str) -> Result<UnixListener> {
    Err(BusError::InvalidAddress(format!(
        "abstract sockets are not supported on this platform: {name}"
    )))
}

// ============================================================================
// Listener
// ============================================================================

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// Listening socket for the responder side.
///
/// A listener bound to a filesystem path removes the socket file when
/// dropped.
pub struct SockListener {
    listener: Listener,
    address: BusAddress,
    path: Option<PathBuf>,
}

/// Guard that removes a socket file on drop.
#[derive(Debug)]
pub struct ListenerCleanup {
    path: PathBuf,
}

impl Drop for ListenerCleanup {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl SockListener {
    /// Bind to `address`.
    ///
    /// Removes any existing socket file at a `unix:path` address first.
    /// A TCP port of 0 picks a free port; [`local_address`] reports it.
    ///
    /// [`local_address`]: SockListener::local_address
    pub fn bind(address: &BusAddress) -> Result<Self> {
        let (listener, address, path) = match address.endpoint() {
            Endpoint::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)?;
                (Listener::Unix(listener), address.clone(), Some(path.clone()))
            }
            Endpoint::UnixAbstract(name) => {
                (Listener::Unix(bind_abstract(name)?), address.clone(), None)
            }
            Endpoint::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port))?;
                let bound = listener.local_addr()?;
                let address = BusAddress::new(Endpoint::Tcp {
                    host: host.clone(),
                    port: bound.port(),
                });
                (Listener::Tcp(listener), address, None)
            }
        };
        debug!(%address, "listening");
        Ok(Self {
            listener,
            address,
            path,
        })
    }

    /// Accept one connection (blocking).
    pub fn accept(&self) -> Result<SockStream> {
        match &self.listener {
            Listener::Unix(l) => {
                let (stream, _addr) = l.accept()?;
                SockStream::from_unix(stream)
            }
            Listener::Tcp(l) => {
                let (stream, _addr) = l.accept()?;
                stream.set_nodelay(true)?;
                SockStream::from_tcp(stream)
            }
        }
    }

    /// Address clients should connect to.
    pub fn local_address(&self) -> BusAddress {
        self.address.clone()
    }

    /// Guard that removes the socket file on drop, for listeners bound to a
    /// path.
    pub fn cleanup_guard(&self) -> Option<ListenerCleanup> {
        self.path.clone().map(|path| ListenerCleanup { path })
    }
}

impl AsRawFd for SockListener {
    fn as_raw_fd(&self) -> RawFd {
        match &self.listener {
            Listener::Unix(l) => l.as_raw_fd(),
            Listener::Tcp(l) => l.as_raw_fd(),
        }
    }
}

impl Drop for SockListener {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            let _ = std::fs::remove_file(path);
        }
    }
}
