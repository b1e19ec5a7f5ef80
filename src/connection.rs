//! Connection and dispatch core.
//!
//! A [`Connection`] owns one transport and everything keyed to it: the
//! authentication handshake, frame reassembly, serial allocation, the reply
//! table, the pending-signal queue and the object and signal registries.
//!
//! # Lifecycle
//!
//! ```text
//! Authenticating ──handshake ok──► Ready ──fatal error / close──► Closed
//!        └────────────handshake failed─────────────────────────────┘
//! ```
//!
//! # Dispatch
//!
//! Every decoded frame goes through [`Connection::feed_bytes`]:
//! 1. a reply whose serial is awaited is stored in the reply table
//! 2. a method call is answered by a built-in (`Ping`, `Introspect`), an
//!    exported object, or an `UnknownMethod` error when a reply is expected
//! 3. a signal is queued and run after the batch that carried it
//!
//! Handlers receive `&mut Connection`, so they may send frames or block in
//! [`Connection::send_and_await_reply`]; a blocking call pumps the
//! transport itself, nested inside the handler's stack frame.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::auth::{finish_lines, Mechanism, SaslClient, SaslServer};
use crate::bus::BusProxy;
use crate::codec::BodyWriter;
use crate::error::{BusError, Result};
use crate::handler::{BusObject, MatchRule, ObjectRegistry, SignalRegistry};
use crate::protocol::{
    flags, Frame, FrameBuffer, MessageKind, ObjectPath, MAX_MESSAGE_LENGTH, UNKNOWN_METHOD_ERROR,
};
use crate::reactor::Reactor;
use crate::transport::{BusAddress, Interest, SockStream, Transport};

/// Interface of the built-in liveness check.
pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";

/// Interface of the built-in introspection query.
pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";

/// Default read chunk size (64 KiB).
pub const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;

/// Connection tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Largest frame accepted or sent.
    pub max_frame_size: usize,
    /// Bytes requested from the transport per read.
    pub read_chunk_size: usize,
    /// Bound on blocking waits for a reply or for the handshake. `None`
    /// waits forever.
    pub reply_timeout: Option<Duration>,
    /// Call the bus daemon's `Hello` after authenticating.
    pub say_hello: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_MESSAGE_LENGTH,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            reply_timeout: None,
            say_hello: false,
        }
    }
}

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Authenticating,
    Ready,
    Closed,
}

enum Handshake {
    Client(SaslClient),
    Server(SaslServer),
}

type MessageObserver = Rc<dyn Fn(&mut Connection, &Frame)>;

/// Builder for connections in either role.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use buswire::ConnectionBuilder;
///
/// # fn main() -> buswire::Result<()> {
/// let mut conn = ConnectionBuilder::new()
///     .reply_timeout(Duration::from_secs(5))
///     .say_hello(true)
///     .connect("unix:path=/run/user/1000/bus")?;
/// println!("connected as {:?}", conn.unique_name());
/// # Ok(())
/// # }
/// ```
pub struct ConnectionBuilder {
    config: ConnectionConfig,
    mechanisms: Vec<Box<dyn Mechanism>>,
    credential: Option<String>,
    guid: Option<String>,
}

impl fmt::Debug for ConnectionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionBuilder")
            .field("config", &self.config)
            .field(
                "mechanisms",
                &self.mechanisms.iter().map(|m| m.name()).collect::<Vec<_>>(),
            )
            .field("credential", &self.credential)
            .field("guid", &self.guid)
            .finish()
    }
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self {
            config: ConnectionConfig::default(),
            mechanisms: Vec::new(),
            credential: None,
            guid: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Largest frame accepted or sent. Default: 128 MiB
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Default: 64 KiB
    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.config.read_chunk_size = size.max(1);
        self
    }

    /// Bound blocking waits. Default: wait forever
    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.config.reply_timeout = Some(timeout);
        self
    }

    /// Register with the bus daemon after connecting. Default: false
    pub fn say_hello(mut self, hello: bool) -> Self {
        self.config.say_hello = hello;
        self
    }

    /// Add a responder mechanism. Without any, the responder accepts
    /// `EXTERNAL` from the same user.
    pub fn mechanism(mut self, mechanism: impl Mechanism + 'static) -> Self {
        self.mechanisms.push(Box::new(mechanism));
        self
    }

    /// Identity the initiator asserts. Default: this process's uid
    pub fn credential(mut self, identity: impl Into<String>) -> Self {
        self.credential = Some(identity.into());
        self
    }

    /// GUID the responder announces. Default: random
    pub fn guid(mut self, guid: impl Into<String>) -> Self {
        self.guid = Some(guid.into());
        self
    }

    /// Connect to the first usable entry of `address` and authenticate as
    /// initiator (blocking).
    pub fn connect(self, address: &str) -> Result<Connection> {
        let mut last_err = None;
        let mut connected = None;
        for addr in BusAddress::parse_list(address)? {
            match SockStream::connect(&addr) {
                Ok(stream) => {
                    connected = Some((stream, addr));
                    break;
                }
                Err(e) => {
                    debug!(address = %addr, error = %e, "connect failed");
                    last_err = Some(e);
                }
            }
        }
        let Some((stream, addr)) = connected else {
            return Err(last_err.unwrap_or_else(|| BusError::InvalidAddress(address.to_owned())));
        };
        let conn = self.connect_transport(stream)?;
        if let (Some(expected), Some(actual)) = (addr.guid(), conn.guid()) {
            if expected != actual {
                warn!(expected, actual, "server guid differs from address");
            }
        }
        Ok(conn)
    }

    /// Authenticate as initiator over a connected transport (blocking).
    pub fn connect_transport<T: Transport + 'static>(self, transport: T) -> Result<Connection> {
        let client = match self.credential {
            Some(identity) => SaslClient::new(identity),
            None => current_user_client(),
        };
        let say_hello = self.config.say_hello;
        let mut conn = Connection::new(Box::new(transport), self.config, Handshake::Client(client));
        conn.start_handshake()?;
        conn.wait_ready()?;
        if say_hello {
            BusProxy::new(&mut conn).hello()?;
        }
        Ok(conn)
    }

    /// Authenticate as responder over `transport` (blocking).
    pub fn accept<T: Transport + 'static>(self, transport: T) -> Result<Connection> {
        let mut conn = self.responder(transport)?;
        conn.wait_ready()?;
        Ok(conn)
    }

    /// Responder connection that authenticates as bytes arrive, for use
    /// with [`Connection::attach`] or [`Connection::feed_bytes`].
    pub fn responder<T: Transport + 'static>(self, transport: T) -> Result<Connection> {
        let mut server = match self.guid {
            Some(guid) => SaslServer::new(guid),
            None => SaslServer::with_random_guid(),
        };
        if self.mechanisms.is_empty() {
            server = default_server(server);
        }
        for mechanism in self.mechanisms {
            server.add_mechanism(mechanism);
        }
        Ok(Connection::new(
            Box::new(transport),
            self.config,
            Handshake::Server(server),
        ))
    }
}

#[cfg(unix)]
fn current_user_client() -> SaslClient {
    SaslClient::current_user()
}

#[cfg(unix)]
fn default_server(server: SaslServer) -> SaslServer {
    server.with_mechanism(crate::auth::External::same_user())
}

/// One authenticated (or authenticating) peer link.
pub struct Connection {
    transport: Box<dyn Transport>,
    config: ConnectionConfig,
    state: ConnectionState,
    handshake: Option<Handshake>,
    frames: FrameBuffer,
    read_buf: Vec<u8>,
    next_serial: u32,
    awaiting: HashSet<u32>,
    replies: HashMap<u32, Frame>,
    pending_signals: VecDeque<Frame>,
    await_depth: usize,
    blocking_handshake: bool,
    held_frames: bool,
    objects: ObjectRegistry,
    signals: SignalRegistry,
    observer: Option<MessageObserver>,
    close_listeners: Vec<Box<dyn FnOnce()>>,
    error: Option<BusError>,
    guid: Option<String>,
    unique_name: Option<String>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("next_serial", &self.next_serial)
            .field("awaiting", &self.awaiting.len())
            .field("pending_signals", &self.pending_signals.len())
            .field("objects", &self.objects.len())
            .field("error", &self.error)
            .field("guid", &self.guid)
            .field("unique_name", &self.unique_name)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Start a builder.
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    fn new(transport: Box<dyn Transport>, config: ConnectionConfig, handshake: Handshake) -> Self {
        Self {
            transport,
            frames: FrameBuffer::with_max_frame_size(config.max_frame_size),
            read_buf: vec![0; config.read_chunk_size.max(1)],
            config,
            state: ConnectionState::Authenticating,
            handshake: Some(handshake),
            next_serial: 1,
            awaiting: HashSet::new(),
            replies: HashMap::new(),
            pending_signals: VecDeque::new(),
            await_depth: 0,
            blocking_handshake: false,
            held_frames: false,
            objects: ObjectRegistry::new(),
            signals: SignalRegistry::new(),
            observer: None,
            close_listeners: Vec::new(),
            error: None,
            guid: None,
            unique_name: None,
        }
    }

    // ========================================================================
    // State
    // ========================================================================

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Server GUID learned (initiator) or announced (responder) during the
    /// handshake.
    pub fn guid(&self) -> Option<&str> {
        self.guid.as_deref()
    }

    /// Unique bus name assigned by `Hello`, if any.
    pub fn unique_name(&self) -> Option<&str> {
        self.unique_name.as_deref()
    }

    pub(crate) fn set_unique_name(&mut self, name: String) {
        self.unique_name = Some(name);
    }

    /// The first fatal error, latched when the connection failed.
    pub fn error(&self) -> Option<&BusError> {
        self.error.as_ref()
    }

    /// Run `listener` once when the connection closes; immediately if it
    /// already has.
    pub fn on_close(&mut self, listener: impl FnOnce() + 'static) {
        if self.is_closed() {
            listener();
        } else {
            self.close_listeners.push(Box::new(listener));
        }
    }

    /// Close the transport and fail outstanding waits. Calling it again is
    /// a no-op.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        self.transport.close();
        self.awaiting.clear();
        self.handshake = None;
        debug!(unique_name = ?self.unique_name, "connection closed");
        for listener in std::mem::take(&mut self.close_listeners) {
            listener();
        }
    }

    /// Latch `err` if it is the first one and close.
    fn fail(&mut self, err: &BusError) {
        if self.error.is_none() {
            error!(error = %err, "connection failed");
            self.error = Some(err.latched_copy());
        }
        self.close();
    }

    /// Pass `result` through, closing the connection on a fatal error.
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.fail(e);
            }
        }
        result
    }

    fn closed_error(&self) -> BusError {
        self.error
            .as_ref()
            .map_or(BusError::ConnectionClosed, BusError::latched_copy)
    }

    // ========================================================================
    // Registries
    // ========================================================================

    /// Export `object` at `path`, replacing any object already there.
    pub fn register(&mut self, path: &str, object: BusObject) -> Result<()> {
        let path = ObjectPath::new(path)?;
        if self.objects.register(&path, object).is_some() {
            debug!(%path, "replaced exported object");
        }
        Ok(())
    }

    /// Stop exporting the object at `path`.
    ///
    /// # Errors
    ///
    /// `NotRegistered` if nothing is exported there.
    pub fn unregister(&mut self, path: &str) -> Result<()> {
        let path = ObjectPath::new(path)?;
        self.objects.unregister(&path)?;
        Ok(())
    }

    pub fn objects(&self) -> &ObjectRegistry {
        &self.objects
    }

    /// Run `handler` for every incoming signal matching `rule`.
    pub fn add_signal_handler<F>(&mut self, rule: MatchRule, handler: F)
    where
        F: Fn(&mut Connection, &Frame) -> Result<()> + 'static,
    {
        self.signals.add(rule, handler);
    }

    pub fn remove_signal_handler(&mut self, rule: &MatchRule) -> bool {
        self.signals.remove(rule)
    }

    /// Observe every decoded frame before it is routed.
    pub fn set_message_observer<F>(&mut self, observer: F)
    where
        F: Fn(&mut Connection, &Frame) + 'static,
    {
        self.observer = Some(Rc::new(observer));
    }

    // ========================================================================
    // Sending
    // ========================================================================

    fn allocate_serial(&mut self) -> u32 {
        loop {
            let serial = self.next_serial;
            self.next_serial = match self.next_serial.wrapping_add(1) {
                0 => 1,
                n => n,
            };
            if !self.awaiting.contains(&serial) {
                return serial;
            }
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let result = self.transport.write_all(bytes).map_err(BusError::from);
        self.guard(result)
    }

    /// Stamp `frame` with a fresh serial and write it. A method call that
    /// expects a reply makes its serial an awaited key; collect the reply
    /// with [`take_reply`](Self::take_reply).
    ///
    /// # Errors
    ///
    /// `NotAuthenticated` before the handshake completes, a `Protocol` or
    /// `Marshal` error for malformed frames, `FrameTooLarge` above the
    /// configured maximum, or the transport's error (which closes the
    /// connection).
    pub fn send(&mut self, mut frame: Frame) -> Result<u32> {
        match self.state {
            ConnectionState::Ready => {}
            ConnectionState::Authenticating => return Err(BusError::NotAuthenticated),
            ConnectionState::Closed => return Err(self.closed_error()),
        }
        let serial = self.allocate_serial();
        frame.set_serial(serial);
        frame.validate()?;
        let bytes = frame.encode()?;
        if bytes.len() > self.config.max_frame_size {
            return Err(BusError::FrameTooLarge {
                size: bytes.len(),
                max: self.config.max_frame_size,
            });
        }
        trace!(
            serial,
            kind = frame.kind().as_str(),
            len = bytes.len(),
            "sending frame"
        );
        if frame.reply_expected() {
            self.awaiting.insert(serial);
        }
        self.write_bytes(&bytes)?;
        Ok(serial)
    }

    /// Reply stored for `serial`, if it has arrived.
    pub fn take_reply(&mut self, serial: u32) -> Option<Frame> {
        self.replies.remove(&serial)
    }

    /// Send a method call and block until its reply arrives.
    ///
    /// Other traffic arriving meanwhile is handled normally: calls are
    /// dispatched, unrelated replies stored and signals queued until the
    /// reply is in, then flushed.
    ///
    /// # Errors
    ///
    /// `Remote` for an error reply, `Timeout` when the configured reply
    /// timeout passes, or whatever failure closed the connection.
    pub fn send_and_await_reply(&mut self, mut frame: Frame) -> Result<Frame> {
        if frame.kind() != MessageKind::MethodCall {
            return Err(BusError::Protocol(format!(
                "cannot await a reply to a {} frame",
                frame.kind().as_str()
            )));
        }
        frame.set_flags(frame.flags() & !flags::NO_REPLY_EXPECTED);
        let serial = self.send(frame)?;
        let deadline = self.config.reply_timeout.map(|t| Instant::now() + t);

        self.await_depth += 1;
        let result = self.await_reply(serial, deadline);
        self.await_depth -= 1;

        if self.await_depth == 0 {
            self.flush_signals();
        }
        let reply = result?;
        if reply.kind() == MessageKind::Error {
            return Err(BusError::Remote {
                name: reply.error_name().unwrap_or_default().to_owned(),
                message: reply.error_message().unwrap_or_default(),
            });
        }
        Ok(reply)
    }

    fn await_reply(&mut self, serial: u32, deadline: Option<Instant>) -> Result<Frame> {
        loop {
            if let Some(reply) = self.replies.remove(&serial) {
                return Ok(reply);
            }
            if self.is_closed() {
                return Err(self.closed_error());
            }
            let remaining = match deadline {
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        self.awaiting.remove(&serial);
                        debug!(serial, "reply timed out");
                        return Err(BusError::Timeout);
                    }
                    Some(left)
                }
                None => None,
            };
            self.poll_once(remaining)?;
        }
    }

    // ========================================================================
    // Receiving
    // ========================================================================

    /// Wait up to `timeout` for the transport to become readable, then
    /// process whatever arrived. Returns whether anything was read.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<bool> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        if self.release_held_frames()? {
            return Ok(true);
        }
        let ready = self.transport.wait(Interest::Readable, timeout);
        if !self.guard(ready.map_err(BusError::from))? {
            return Ok(false);
        }
        Ok(self.read_available()? > 0)
    }

    /// Serve until the peer closes the connection.
    pub fn run(&mut self) -> Result<()> {
        while !self.is_closed() {
            self.poll_once(None)?;
        }
        match self.error.as_ref() {
            Some(e) => Err(e.latched_copy()),
            None => Ok(()),
        }
    }

    /// Block until the handshake completes. Frames pipelined behind the
    /// final handshake line stay buffered until the next pump, so the
    /// caller can register objects first.
    fn wait_ready(&mut self) -> Result<()> {
        let deadline = self.config.reply_timeout.map(|t| Instant::now() + t);
        self.blocking_handshake = true;
        let result = self.wait_handshake(deadline);
        self.blocking_handshake = false;
        result?;
        if self.is_closed() {
            return Err(self.closed_error());
        }
        Ok(())
    }

    fn wait_handshake(&mut self, deadline: Option<Instant>) -> Result<()> {
        while self.state == ConnectionState::Authenticating {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if remaining.is_some_and(|r| r.is_zero()) {
                self.fail(&BusError::Timeout);
                return Err(BusError::Timeout);
            }
            self.poll_once(remaining)?;
        }
        Ok(())
    }

    /// Dispatch frames held back by a blocking handshake. Returns whether
    /// there were any.
    fn release_held_frames(&mut self) -> Result<bool> {
        if !self.held_frames {
            return Ok(false);
        }
        self.held_frames = false;
        let result = self.decode_buffered();
        self.guard(result)?;
        if self.await_depth == 0 {
            self.flush_signals();
        }
        Ok(true)
    }

    /// Read until the transport would block, processing each chunk.
    /// Returns the number of bytes read; end of stream closes the
    /// connection.
    pub fn read_available(&mut self) -> Result<usize> {
        self.release_held_frames()?;
        let mut total = 0;
        // a handler pumping from inside this loop finds the buffer taken
        let mut buf = std::mem::take(&mut self.read_buf);
        if buf.is_empty() {
            buf = vec![0; self.config.read_chunk_size.max(1)];
        }
        let result = loop {
            if self.is_closed() {
                break Ok(total);
            }
            match self.transport.read(&mut buf) {
                Ok(0) if self.state == ConnectionState::Authenticating => {
                    let err = match finish_lines(self.frames.accumulator()) {
                        Err(e) => e,
                        Ok(()) => BusError::ConnectionClosed,
                    };
                    debug!(error = %err, "peer closed the connection during the handshake");
                    self.fail(&err);
                    break Err(err);
                }
                Ok(0) => {
                    debug!("peer closed the connection");
                    self.close();
                    break Ok(total);
                }
                Ok(n) => {
                    total += n;
                    if let Err(e) = self.feed_bytes(&buf[..n]) {
                        break Err(e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(total),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    let err = BusError::Io(e);
                    self.fail(&err);
                    break Err(err);
                }
            }
        };
        self.read_buf = buf;
        result
    }

    /// Process bytes delivered by the caller instead of read from the
    /// transport. Returns how many more bytes the next frame (or handshake
    /// line) needs at least.
    ///
    /// # Errors
    ///
    /// A decode or handshake failure, which also closes the connection.
    pub fn feed_bytes(&mut self, data: &[u8]) -> Result<usize> {
        let result = self.process_bytes(data);
        let hint = self.guard(result)?;
        if self.await_depth == 0 {
            self.flush_signals();
        }
        Ok(hint)
    }

    fn process_bytes(&mut self, data: &[u8]) -> Result<usize> {
        match self.state {
            ConnectionState::Closed => return Err(self.closed_error()),
            ConnectionState::Authenticating => {
                self.frames.accumulator_mut().append(data);
                self.advance_handshake()?;
                if self.state != ConnectionState::Ready {
                    return Ok(1);
                }
                if self.blocking_handshake {
                    self.held_frames = !self.frames.is_empty();
                    return Ok(0);
                }
            }
            ConnectionState::Ready => {
                self.frames.accumulator_mut().append(data);
            }
        }
        self.decode_buffered()
    }

    /// Decode and route every complete buffered frame. Returns the
    /// reassembly hint.
    fn decode_buffered(&mut self) -> Result<usize> {
        let batch = self.frames.drain()?;
        for frame in batch.frames {
            if self.is_closed() {
                break;
            }
            let serial = frame.serial();
            if let Err(e) = self.on_frame_decoded(frame) {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(serial, error = %e, "dropping frame after dispatch failure");
            }
        }
        Ok(batch.hint)
    }

    fn start_handshake(&mut self) -> Result<()> {
        let opening = match &mut self.handshake {
            Some(Handshake::Client(client)) => client.start(),
            _ => return Ok(()),
        };
        self.write_bytes(&opening)
    }

    fn advance_handshake(&mut self) -> Result<()> {
        let acc = self.frames.accumulator_mut();
        let out = match &mut self.handshake {
            Some(Handshake::Client(client)) => client.feed(acc)?,
            Some(Handshake::Server(server)) => server.feed(acc)?,
            None => return Ok(()),
        };
        if !out.is_empty() {
            self.write_bytes(&out)?;
        }
        let outcome = match &self.handshake {
            Some(Handshake::Client(client)) if client.is_finished() => {
                Some(Ok(client.guid().map(str::to_owned)))
            }
            Some(Handshake::Server(server)) if server.is_finished() => {
                if server.is_authenticated() {
                    Some(Ok(Some(server.guid().to_owned())))
                } else {
                    Some(Err(BusError::AuthFailed))
                }
            }
            _ => None,
        };
        match outcome {
            None => Ok(()),
            Some(Err(e)) => Err(e),
            Some(Ok(guid)) => {
                debug!(?guid, "handshake complete");
                self.guid = guid;
                self.handshake = None;
                self.state = ConnectionState::Ready;
                Ok(())
            }
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Route one decoded frame.
    fn on_frame_decoded(&mut self, frame: Frame) -> Result<()> {
        trace!(
            serial = frame.serial(),
            kind = frame.kind().as_str(),
            "received frame"
        );
        if let Some(observer) = self.observer.clone() {
            observer(self, &frame);
        }

        match frame.kind() {
            MessageKind::MethodReturn | MessageKind::Error => {
                let Some(reply_serial) = frame.reply_serial() else {
                    warn!(serial = frame.serial(), "reply without reply serial");
                    return Ok(());
                };
                if self.awaiting.remove(&reply_serial) {
                    self.replies.insert(reply_serial, frame);
                } else if frame.kind() == MessageKind::Error {
                    warn!(
                        reply_serial,
                        name = frame.error_name().unwrap_or_default(),
                        message = frame.error_message().unwrap_or_default(),
                        "unsolicited error reply"
                    );
                } else {
                    debug!(reply_serial, "dropping unsolicited reply");
                }
                Ok(())
            }
            MessageKind::Signal => {
                self.pending_signals.push_back(frame);
                Ok(())
            }
            MessageKind::MethodCall => self.dispatch_call(&frame),
        }
    }

    fn dispatch_call(&mut self, call: &Frame) -> Result<()> {
        let interface = call.interface();
        let member = call.member().unwrap_or_default();
        let path = call.path().and_then(|p| ObjectPath::new(p).ok());

        let builtin = |name: &str| interface.map_or(true, |i| i == name);
        if builtin(PEER_INTERFACE) && member == "Ping" {
            return self.reply(call, Frame::method_return(call));
        }
        if builtin(INTROSPECTABLE_INTERFACE) && member == "Introspect" {
            let xml = self.objects.introspect(path.as_ref().unwrap_or(&ObjectPath::root()));
            let mut w = BodyWriter::new(call.endian());
            w.write_str(&xml)?;
            return self.reply(call, Frame::method_return(call).with_body("s", w.into_bytes()));
        }

        let handler = path
            .as_ref()
            .and_then(|p| self.objects.get(p))
            .and_then(|object| {
                object
                    .find(interface, member, call.signature())
                    .map(|m| m.handler())
            });

        let Some(handler) = handler else {
            debug!(
                path = call.path().unwrap_or_default(),
                interface = interface.unwrap_or_default(),
                member,
                "no handler for call"
            );
            let message = format!(
                "Unknown dbus method '{}'.'{}'",
                interface.unwrap_or_default(),
                member
            );
            return self.reply(
                call,
                Frame::error_reply(call, UNKNOWN_METHOD_ERROR, Some(&message))?,
            );
        };

        let response = match handler.call(self, call) {
            Ok(reply) => reply.into_frame(call),
            Err(e) => {
                debug!(member, error = %e, "method failed");
                Frame::error_reply(call, &e.name, Some(&e.message))?
            }
        };
        self.reply(call, response)
    }

    /// Send `response` if `call` wants one.
    fn reply(&mut self, call: &Frame, response: Frame) -> Result<()> {
        if !call.reply_expected() || self.is_closed() {
            return Ok(());
        }
        match self.send(response) {
            Ok(_) => Ok(()),
            Err(e) if !self.is_closed() => {
                // reply could not be encoded; tell the caller instead
                warn!(error = %e, "reply rejected, sending error instead");
                let fallback =
                    Frame::error_reply(call, crate::handler::FAILED_ERROR, Some(&e.to_string()))?;
                self.send(fallback).map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    /// Run queued signals through the signal registry, oldest first.
    pub fn flush_signals(&mut self) {
        while let Some(signal) = self.pending_signals.pop_front() {
            let handlers = self.signals.matching(&signal);
            if handlers.is_empty() {
                trace!(
                    member = signal.member().unwrap_or_default(),
                    "no handler for signal"
                );
                continue;
            }
            for handler in handlers {
                if let Err(e) = handler(self, &signal) {
                    warn!(
                        member = signal.member().unwrap_or_default(),
                        error = %e,
                        "signal handler failed"
                    );
                }
            }
        }
    }

    /// Number of signals waiting for the next flush.
    pub fn pending_signal_count(&self) -> usize {
        self.pending_signals.len()
    }

    // ========================================================================
    // Reactor integration
    // ========================================================================

    /// Drive `conn` from `reactor`: readable events read and dispatch, and
    /// the registration is withdrawn when the connection closes.
    ///
    /// Handlers run while `conn` is mutably borrowed; use the
    /// `&mut Connection` they receive rather than `conn` itself. Frames
    /// held back by a blocking handshake are dispatched here, so register
    /// objects before attaching.
    ///
    /// # Errors
    ///
    /// `Protocol` if the transport has no descriptor to poll.
    pub fn attach(conn: &Rc<RefCell<Connection>>, reactor: &mut Reactor) -> Result<()> {
        let fd = conn
            .borrow()
            .transport
            .raw_fd()
            .ok_or_else(|| BusError::Protocol("transport has no descriptor".into()))?;

        conn.borrow_mut().release_held_frames()?;

        let handle = reactor.handle();
        conn.borrow_mut().on_close(move || {
            handle.schedule_pending(attach_key(fd), move |r| r.on_readable(fd, None));
        });

        let weak = Rc::downgrade(conn);
        reactor.on_readable(
            fd,
            Some(Box::new(move |reactor| {
                let Some(conn) = weak.upgrade() else {
                    reactor.on_readable(fd, None);
                    return;
                };
                let mut conn = conn.borrow_mut();
                if let Err(e) = conn.read_available() {
                    debug!(fd, error = %e, "read failed");
                }
                if conn.is_closed() {
                    reactor.on_readable(fd, None);
                }
            })),
        );
        Ok(())
    }
}

/// Pending-queue key used to withdraw an attached connection.
fn attach_key(fd: i32) -> u64 {
    (1 << 63) | u64::from(fd as u32)
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Anonymous;
    use crate::codec::Arg;
    use crate::handler::Reply;
    use std::cell::Cell;

    /// In-memory transport capturing writes.
    #[derive(Default)]
    struct Sink {
        written: Rc<RefCell<Vec<u8>>>,
        open: bool,
    }

    impl Transport for Sink {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn wait(&mut self, _interest: Interest, _timeout: Option<Duration>) -> io::Result<bool> {
            Ok(false)
        }
        fn raw_fd(&self) -> Option<std::os::fd::RawFd> {
            None
        }
        fn close(&mut self) {
            self.open = false;
        }
        fn is_open(&self) -> bool {
            self.open
        }
    }

    type Reads = Rc<RefCell<VecDeque<Option<Vec<u8>>>>>;

    /// Transport replaying queued reads; `None` reads as end of stream.
    struct Script {
        reads: Reads,
        written: Rc<RefCell<Vec<u8>>>,
        open: bool,
    }

    impl Script {
        fn new(chunks: Vec<Option<Vec<u8>>>) -> (Self, Reads, Rc<RefCell<Vec<u8>>>) {
            let reads: Reads = Rc::new(RefCell::new(chunks.into()));
            let written = Rc::new(RefCell::new(Vec::new()));
            let script = Script {
                reads: reads.clone(),
                written: written.clone(),
                open: true,
            };
            (script, reads, written)
        }
    }

    impl Transport for Script {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut reads = self.reads.borrow_mut();
            match reads.pop_front() {
                Some(Some(mut chunk)) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        reads.push_front(Some(chunk.split_off(n)));
                    }
                    Ok(n)
                }
                Some(None) => Ok(0),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn wait(&mut self, _interest: Interest, _timeout: Option<Duration>) -> io::Result<bool> {
            Ok(!self.reads.borrow().is_empty())
        }
        fn raw_fd(&self) -> Option<std::os::fd::RawFd> {
            None
        }
        fn close(&mut self) {
            self.open = false;
        }
        fn is_open(&self) -> bool {
            self.open
        }
    }

    /// Responder over a sink, already past the handshake.
    fn ready_responder() -> (Connection, Rc<RefCell<Vec<u8>>>) {
        let written = Rc::new(RefCell::new(Vec::new()));
        let sink = Sink {
            written: written.clone(),
            open: true,
        };
        let mut conn = ConnectionBuilder::new()
            .guid("feed")
            .mechanism(Anonymous)
            .responder(sink)
            .unwrap();
        conn.feed_bytes(b"\0AUTH ANONYMOUS\r\nBEGIN\r\n").unwrap();
        assert!(conn.is_ready());
        written.borrow_mut().clear();
        (conn, written)
    }

    fn sent_frames(written: &Rc<RefCell<Vec<u8>>>) -> Vec<Frame> {
        let mut fb = FrameBuffer::new();
        let frames = fb.push(&written.borrow()).unwrap().frames;
        written.borrow_mut().clear();
        frames
    }

    fn call(path: &str, iface: Option<&str>, member: &str, serial: u32) -> Frame {
        let mut f = Frame::method_call(None, path, iface, member);
        f.set_serial(serial);
        f
    }

    fn feed(conn: &mut Connection, frame: &Frame) {
        conn.feed_bytes(&frame.encode().unwrap()).unwrap();
    }

    #[test]
    fn test_config_default_and_serde() {
        let config = ConnectionConfig::default();
        assert_eq!(config.max_frame_size, MAX_MESSAGE_LENGTH);
        assert_eq!(config.read_chunk_size, 64 * 1024);
        assert_eq!(config.reply_timeout, None);
        assert!(!config.say_hello);

        let parsed: ConnectionConfig =
            serde_json::from_str(r#"{"say_hello": true, "reply_timeout": {"secs": 2, "nanos": 0}}"#)
                .unwrap();
        assert!(parsed.say_hello);
        assert_eq!(parsed.reply_timeout, Some(Duration::from_secs(2)));
        assert_eq!(parsed.max_frame_size, MAX_MESSAGE_LENGTH);
    }

    #[test]
    fn test_handshake_gates_frames() {
        let written = Rc::new(RefCell::new(Vec::new()));
        let sink = Sink {
            written: written.clone(),
            open: true,
        };
        let mut conn = ConnectionBuilder::new()
            .guid("abcd")
            .mechanism(Anonymous)
            .responder(sink)
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Authenticating);
        assert!(matches!(
            conn.send(Frame::signal("/a", "i.I", "S")),
            Err(BusError::NotAuthenticated)
        ));

        // frame bytes pipelined right after BEGIN are kept
        let mut ping = call("/", Some(PEER_INTERFACE), "Ping", 9);
        ping.set_sender(":1.9");
        let mut bytes = b"\0AUTH ANONYMOUS\r\nBEGIN\r\n".to_vec();
        bytes.extend(ping.encode().unwrap());
        conn.feed_bytes(&bytes).unwrap();

        assert!(conn.is_ready());
        assert_eq!(conn.guid(), Some("abcd"));
        let out = written.borrow().clone();
        assert!(out.starts_with(b"OK abcd\r\n"));
        let mut fb = FrameBuffer::new();
        let frames = fb.push(&out[b"OK abcd\r\n".len()..]).unwrap().frames;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].reply_serial(), Some(9));
        assert_eq!(frames[0].destination(), Some(":1.9"));
    }

    #[test]
    fn test_begin_without_auth_fails() {
        let sink = Sink {
            open: true,
            ..Default::default()
        };
        let mut conn = ConnectionBuilder::new().mechanism(Anonymous).responder(sink).unwrap();
        assert!(matches!(conn.feed_bytes(b"BEGIN\r\n"), Err(BusError::AuthFailed)));
        assert!(conn.is_closed());
        assert!(matches!(conn.error(), Some(BusError::AuthFailed)));
    }

    #[test]
    fn test_ping_and_introspect_builtins() {
        let (mut conn, written) = ready_responder();
        conn.register("/a/b", BusObject::new()).unwrap();
        conn.register("/a/c", BusObject::new()).unwrap();

        feed(&mut conn, &call("/", Some(PEER_INTERFACE), "Ping", 1));
        feed(
            &mut conn,
            &call("/a", Some(INTROSPECTABLE_INTERFACE), "Introspect", 2),
        );
        let replies = sent_frames(&written);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].kind(), MessageKind::MethodReturn);
        assert_eq!(replies[0].signature(), "");
        assert_eq!(replies[1].signature(), "s");
        let xml = replies[1].body_reader().read_str().unwrap().to_owned();
        assert!(xml.contains("<node name=\"b\"/>"));
        assert!(xml.contains("<node name=\"c\"/>"));
    }

    #[test]
    fn test_unknown_method_reply_only_when_expected() {
        let (mut conn, written) = ready_responder();
        feed(&mut conn, &call("/nowhere", Some("org.example.X"), "Go", 5));
        let replies = sent_frames(&written);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].error_name(), Some(UNKNOWN_METHOD_ERROR));
        assert_eq!(replies[0].signature(), "s");
        assert_eq!(
            replies[0].error_message().as_deref(),
            Some("Unknown dbus method 'org.example.X'.'Go'")
        );

        let quiet = call("/nowhere", Some("org.example.X"), "Go", 6)
            .with_flags(flags::NO_REPLY_EXPECTED);
        feed(&mut conn, &quiet);
        assert!(sent_frames(&written).is_empty());
        assert!(conn.is_ready());
    }

    #[test]
    fn test_dispatch_to_object() {
        let (mut conn, written) = ready_responder();
        conn.register(
            "/calc",
            BusObject::new()
                .method("org.example.Calc", "Add", "uu", "u", |_conn, call| {
                    let mut r = call.body_reader();
                    let sum = r.read_u32()? + r.read_u32()?;
                    Ok(Reply::args(call.endian(), &[Arg::Uint32(sum)])?)
                })
                .method("org.example.Calc", "Fail", "", "", |_conn, _call| {
                    Err(crate::handler::MethodError::new("org.example.Oops", "nope"))
                }),
        )
        .unwrap();

        let mut w = BodyWriter::new(crate::protocol::Endian::native());
        w.write_u32(2);
        w.write_u32(40);
        let add = call("/calc", Some("org.example.Calc"), "Add", 3).with_body("uu", w.into_bytes());
        feed(&mut conn, &add);
        feed(&mut conn, &call("/calc", None, "Fail", 4));

        let replies = sent_frames(&written);
        assert_eq!(replies[0].body_reader().read_u32().unwrap(), 42);
        assert_eq!(replies[0].reply_serial(), Some(3));
        assert_eq!(replies[1].error_name(), Some("org.example.Oops"));
        assert_eq!(replies[1].error_message().as_deref(), Some("nope"));
    }

    #[test]
    fn test_signals_flush_after_batch_in_order() {
        let (mut conn, _written) = ready_responder();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let rule = MatchRule::signal("/s", "org.example.S", "Tick").unwrap();
        let s = seen.clone();
        conn.add_signal_handler(rule, move |_conn, signal| {
            s.borrow_mut().push(signal.serial());
            Ok(())
        });

        let mut bytes = Vec::new();
        for serial in [7, 8] {
            let mut sig = Frame::signal("/s", "org.example.S", "Tick");
            sig.set_serial(serial);
            bytes.extend(sig.encode().unwrap());
        }
        let mut other = Frame::signal("/s", "org.example.S", "Tock");
        other.set_serial(9);
        bytes.extend(other.encode().unwrap());

        conn.feed_bytes(&bytes).unwrap();
        assert_eq!(*seen.borrow(), vec![7, 8]);
        assert_eq!(conn.pending_signal_count(), 0);
    }

    #[test]
    fn test_reply_routing_and_unsolicited() {
        let (mut conn, written) = ready_responder();
        let s1 = conn.send(Frame::method_call(None, "/p", None, "A")).unwrap();
        let s2 = conn.send(Frame::method_call(None, "/p", None, "B")).unwrap();
        assert_ne!(s1, s2);
        let calls = sent_frames(&written);

        // replies arrive reversed
        let mut r2 = Frame::method_return(&calls[1]);
        r2.set_serial(100);
        let mut r1 = Frame::method_return(&calls[0]);
        r1.set_serial(101);
        feed(&mut conn, &r2);
        feed(&mut conn, &r1);
        assert_eq!(conn.take_reply(s1).unwrap().serial(), 101);
        assert_eq!(conn.take_reply(s2).unwrap().serial(), 100);
        assert!(conn.take_reply(s1).is_none());

        // a second reply for the same serial is dropped
        feed(&mut conn, &r1);
        assert!(conn.take_reply(s1).is_none());
    }

    #[test]
    fn test_no_reply_expected_is_not_awaited() {
        let (mut conn, _written) = ready_responder();
        let serial = conn
            .send(Frame::method_call(None, "/p", None, "A").with_flags(flags::NO_REPLY_EXPECTED))
            .unwrap();
        let mut reply = Frame::new(MessageKind::MethodReturn);
        reply.set_field(
            crate::protocol::HeaderField::ReplySerial,
            crate::protocol::FieldValue::U32(serial),
        );
        reply.set_serial(50);
        feed(&mut conn, &reply);
        assert!(conn.take_reply(serial).is_none());
    }

    #[test]
    fn test_serial_wraps_past_zero() {
        let (mut conn, _written) = ready_responder();
        conn.next_serial = u32::MAX;
        let a = conn.send(Frame::signal("/a", "i.I", "S")).unwrap();
        let b = conn.send(Frame::signal("/a", "i.I", "S")).unwrap();
        assert_eq!(a, u32::MAX);
        assert_eq!(b, 1);
    }

    #[test]
    fn test_send_side_size_limit() {
        let written = Rc::new(RefCell::new(Vec::new()));
        let sink = Sink {
            written: written.clone(),
            open: true,
        };
        let mut conn = ConnectionBuilder::new()
            .max_frame_size(256)
            .mechanism(Anonymous)
            .responder(sink)
            .unwrap();
        conn.feed_bytes(b"AUTH ANONYMOUS\r\nBEGIN\r\n").unwrap();
        let big = Frame::signal("/a", "i.I", "S").with_body("ay", vec![0u8; 512]);
        assert!(matches!(conn.send(big), Err(BusError::FrameTooLarge { .. })));
        assert!(conn.is_ready());
    }

    #[test]
    fn test_bad_frame_is_fatal_and_latched() {
        let (mut conn, _written) = ready_responder();
        let closed = Rc::new(Cell::new(0));
        let c = closed.clone();
        conn.on_close(move || c.set(c.get() + 1));
        let mut bytes = call("/", None, "X", 1).encode().unwrap();
        bytes[3] = 9;
        assert!(matches!(
            conn.feed_bytes(&bytes),
            Err(BusError::ProtocolVersionUnsupported(9))
        ));
        assert!(conn.is_closed());
        assert!(matches!(
            conn.feed_bytes(b"more"),
            Err(BusError::ProtocolVersionUnsupported(9))
        ));
        conn.close();
        conn.close();
        assert_eq!(closed.get(), 1);
    }

    #[test]
    fn test_feed_hint() {
        let (mut conn, _written) = ready_responder();
        let mut sig = Frame::signal("/a", "i.I", "S");
        sig.set_serial(1);
        let bytes = sig.encode().unwrap();
        assert_eq!(conn.feed_bytes(&bytes[..4]).unwrap(), 12);
        assert_eq!(conn.feed_bytes(&bytes[4..16]).unwrap(), bytes.len() - 16);
        assert_eq!(conn.feed_bytes(&bytes[16..]).unwrap(), 16);
    }

    #[test]
    fn test_observer_sees_every_frame() {
        let (mut conn, _written) = ready_responder();
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        conn.set_message_observer(move |_conn, _frame| c.set(c.get() + 1));
        feed(&mut conn, &call("/", Some(PEER_INTERFACE), "Ping", 1));
        let mut sig = Frame::signal("/a", "i.I", "S");
        sig.set_serial(2);
        feed(&mut conn, &sig);
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn test_unregister_absent() {
        let (mut conn, _written) = ready_responder();
        assert!(matches!(
            conn.unregister("/missing"),
            Err(BusError::NotRegistered(_))
        ));
        assert!(matches!(
            conn.register("bad", BusObject::new()),
            Err(BusError::InvalidObjectPath(_))
        ));
        assert!(conn.is_ready());
    }

    #[test]
    fn test_builtins_without_interface() {
        let (mut conn, written) = ready_responder();
        conn.register("/a/b", BusObject::new()).unwrap();
        feed(&mut conn, &call("/", None, "Ping", 1));
        feed(&mut conn, &call("/a", None, "Introspect", 2));
        let replies = sent_frames(&written);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].kind(), MessageKind::MethodReturn);
        assert_eq!(replies[1].kind(), MessageKind::MethodReturn);
        assert_eq!(replies[1].signature(), "s");
    }

    #[test]
    fn test_dispatch_failure_keeps_rest_of_batch() {
        let (mut conn, written) = ready_responder();
        conn.register(
            "/bad",
            BusObject::new().method("org.example.Bad", "Go", "", "", |_conn, _call| {
                Err(crate::handler::MethodError::new("org.example.Bad", "nul\0inside"))
            }),
        )
        .unwrap();

        let mut bytes = call("/bad", Some("org.example.Bad"), "Go", 1).encode().unwrap();
        bytes.extend(call("/", Some(PEER_INTERFACE), "Ping", 2).encode().unwrap());
        conn.feed_bytes(&bytes).unwrap();

        let replies = sent_frames(&written);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].reply_serial(), Some(2));
        assert!(conn.is_ready());
    }

    #[test]
    fn test_handler_pumps_nested_reply() {
        let (script, reads, written) = Script::new(Vec::new());
        let mut conn = ConnectionBuilder::new()
            .mechanism(Anonymous)
            .responder(script)
            .unwrap();
        conn.feed_bytes(b"\0AUTH ANONYMOUS\r\nBEGIN\r\n").unwrap();
        written.borrow_mut().clear();
        conn.register(
            "/relay",
            BusObject::new().method("org.example.Relay", "Relay", "", "u", |conn, call| {
                let back = Frame::method_call(None, "/cb", None, "Get");
                let value = conn.send_and_await_reply(back)?.body_reader().read_u32()?;
                Ok(Reply::args(call.endian(), &[Arg::Uint32(value + 1)])?)
            }),
        )
        .unwrap();

        // the nested call is the first frame this side sends
        let mut get = Frame::method_call(None, "/cb", None, "Get");
        get.set_serial(1);
        let mut w = BodyWriter::new(get.endian());
        w.write_u32(41);
        let mut answer = Frame::method_return(&get).with_body("u", w.into_bytes());
        answer.set_serial(10);
        let relay = call("/relay", Some("org.example.Relay"), "Relay", 3);
        reads.borrow_mut().push_back(Some(relay.encode().unwrap()));
        reads.borrow_mut().push_back(Some(answer.encode().unwrap()));

        assert!(conn.poll_once(None).unwrap());
        let out = sent_frames(&written);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].member(), Some("Get"));
        assert_eq!(out[1].reply_serial(), Some(3));
        assert_eq!(out[1].body_reader().read_u32().unwrap(), 42);
        assert!(conn.is_ready());
    }

    #[test]
    fn test_eof_mid_line_is_incomplete_line() {
        let (script, _reads, _written) =
            Script::new(vec![Some(b"\0AUTH EXTERN".to_vec()), None]);
        let result = ConnectionBuilder::new().mechanism(Anonymous).accept(script);
        assert!(matches!(result, Err(BusError::IncompleteLine)));
    }

    #[test]
    fn test_eof_between_lines_is_closed() {
        let (script, _reads, _written) = Script::new(vec![None]);
        let result = ConnectionBuilder::new().mechanism(Anonymous).accept(script);
        assert!(matches!(result, Err(BusError::ConnectionClosed)));
    }

    #[test]
    fn test_frames_behind_begin_wait_for_registration() {
        let mut bytes = b"\0AUTH ANONYMOUS\r\nBEGIN\r\n".to_vec();
        bytes.extend(call("/x", Some("org.example.X"), "Get", 1).encode().unwrap());
        let (script, _reads, written) = Script::new(vec![Some(bytes)]);

        let mut conn = ConnectionBuilder::new()
            .guid("feed")
            .mechanism(Anonymous)
            .accept(script)
            .unwrap();
        assert_eq!(written.borrow().as_slice(), b"OK feed\r\n");
        written.borrow_mut().clear();

        conn.register(
            "/x",
            BusObject::new().method("org.example.X", "Get", "", "u", |_conn, call| {
                Ok(Reply::args(call.endian(), &[Arg::Uint32(7)])?)
            }),
        )
        .unwrap();
        assert!(conn.poll_once(Some(Duration::ZERO)).unwrap());

        let replies = sent_frames(&written);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].kind(), MessageKind::MethodReturn);
        assert_eq!(replies[0].body_reader().read_u32().unwrap(), 7);
    }
}
