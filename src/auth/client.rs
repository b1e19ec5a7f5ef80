//! Initiator side of the authentication handshake.
//!
//! Offers a single `EXTERNAL` credential:
//! ```text
//! WaitingForData ──send AUTH──► WaitingForOK ──recv OK, send BEGIN──► Terminate
//! ```
//! Anything other than `OK <guid>` in reply to `AUTH` is fatal.

use tracing::debug;

use super::line::{encode_line, next_line};
use crate::buffer::ByteAccumulator;
use crate::error::{BusError, Result};

/// Initiator states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Nothing sent yet.
    WaitingForData,
    /// `AUTH` sent, waiting for the verdict.
    WaitingForOK,
    /// `BEGIN` sent; the binary protocol follows.
    Terminate,
}

/// SASL initiator for the `EXTERNAL` mechanism.
#[derive(Debug, Clone)]
pub struct SaslClient {
    state: ClientState,
    identity: String,
    send_nul: bool,
    guid: Option<String>,
}

impl SaslClient {
    /// Initiator asserting `identity` (usually the decimal uid).
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            state: ClientState::WaitingForData,
            identity: identity.into(),
            send_nul: true,
            guid: None,
        }
    }

    /// Initiator asserting the uid this process runs as.
    #[cfg(unix)]
    pub fn current_user() -> Self {
        Self::new(nix::unistd::getuid().as_raw().to_string())
    }

    /// Whether to open with the credentials NUL byte (default true).
    pub fn with_leading_nul(mut self, send: bool) -> Self {
        self.send_nul = send;
        self
    }

    #[inline]
    pub fn state(&self) -> ClientState {
        self.state
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.state == ClientState::Terminate
    }

    /// GUID the responder announced in its `OK` line.
    pub fn guid(&self) -> Option<&str> {
        self.guid.as_deref()
    }

    /// Bytes that open the handshake.
    pub fn start(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        if self.send_nul {
            out.push(0);
        }
        out.extend(encode_line(&format!(
            "AUTH EXTERNAL {}",
            hex::encode(self.identity.as_bytes())
        )));
        self.state = ClientState::WaitingForOK;
        out
    }

    /// Handle one responder line. Returns the bytes to send back.
    ///
    /// # Errors
    ///
    /// `AuthRejected` for anything but `OK <guid>`.
    pub fn process_line(&mut self, line: &str) -> Result<Vec<u8>> {
        if self.state != ClientState::WaitingForOK {
            return Err(BusError::AuthRejected(format!(
                "unexpected line {line:?} in state {:?}",
                self.state
            )));
        }
        let mut tokens = line.split_ascii_whitespace();
        match (tokens.next(), tokens.next()) {
            (Some("OK"), guid) => {
                self.guid = guid.map(str::to_owned);
                self.state = ClientState::Terminate;
                debug!(guid = ?self.guid, "authenticated");
                Ok(encode_line("BEGIN"))
            }
            _ => Err(BusError::AuthRejected(line.to_owned())),
        }
    }

    /// Consume responder lines from `acc` until finished or no full line
    /// remains. Returns the bytes to send back.
    pub fn feed(&mut self, acc: &mut ByteAccumulator) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while !self.is_finished() {
            let Some(line) = next_line(acc)? else {
                break;
            };
            out.extend(self.process_line(&line)?);
        }
        Ok(out)
    }
}
