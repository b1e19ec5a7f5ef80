//! Responder side of the authentication handshake.
//!
//! State machine:
//! ```text
//!                 AUTH ok            BEGIN
//! WaitingForAuth ────────► WaitingForBegin ────► DoneAuth
//!   │  ▲   │ AUTH continue        ▲
//!   │  │   ▼                      │ DATA ok
//!   │  └─ WaitingForData ─────────┘
//!   │ BEGIN      │ BEGIN
//!   ▼            ▼
//!  Terminate ◄───┘
//! ```
//! `REJECT` always returns to `WaitingForAuth`; retries are unbounded.

use std::fmt;

use tracing::{debug, warn};

use super::line::{encode_line, next_line};
use super::mechanism::{AuthContext, MechResponse, Mechanism};
use crate::buffer::ByteAccumulator;
use crate::error::Result;

/// Responder states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    WaitingForAuth,
    WaitingForData,
    WaitingForBegin,
    /// Terminal: the client began without authenticating.
    Terminate,
    /// Terminal: authenticated.
    DoneAuth,
}

/// SASL responder with an ordered table of mechanisms.
pub struct SaslServer {
    state: ServerState,
    mechanisms: Vec<Box<dyn Mechanism>>,
    context: Option<Box<dyn AuthContext>>,
    active: Option<String>,
    guid: String,
    saw_first_byte: bool,
}

impl fmt::Debug for SaslServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslServer")
            .field("state", &self.state)
            .field("mechanisms", &self.mechanism_names())
            .field("active", &self.active)
            .field("guid", &self.guid)
            .finish()
    }
}

impl SaslServer {
    /// Create a responder that answers `OK <guid>`.
    pub fn new(guid: impl Into<String>) -> Self {
        Self {
            state: ServerState::WaitingForAuth,
            mechanisms: Vec::new(),
            context: None,
            active: None,
            guid: guid.into(),
            saw_first_byte: false,
        }
    }

    /// Create a responder with a random GUID.
    pub fn with_random_guid() -> Self {
        Self::new(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Add a mechanism. A later mechanism with the same name replaces
    /// the earlier one.
    pub fn add_mechanism(&mut self, mechanism: Box<dyn Mechanism>) {
        self.mechanisms.retain(|m| m.name() != mechanism.name());
        self.mechanisms.push(mechanism);
    }

    /// Builder-style [`add_mechanism`](Self::add_mechanism).
    pub fn with_mechanism(mut self, mechanism: impl Mechanism + 'static) -> Self {
        self.add_mechanism(Box::new(mechanism));
        self
    }

    #[inline]
    pub fn state(&self) -> ServerState {
        self.state
    }

    #[inline]
    pub fn guid(&self) -> &str {
        &self.guid
    }

    /// Name of the mechanism that authenticated the peer.
    pub fn authenticated_with(&self) -> Option<&str> {
        match self.state {
            ServerState::DoneAuth => self.active.as_deref(),
            _ => None,
        }
    }

    /// Whether a terminal state was reached.
    #[inline]
    pub fn is_finished(&self) -> bool {
        matches!(self.state, ServerState::Terminate | ServerState::DoneAuth)
    }

    #[inline]
    pub fn is_authenticated(&self) -> bool {
        self.state == ServerState::DoneAuth
    }

    /// Supported mechanism names in configuration order.
    pub fn mechanism_names(&self) -> Vec<&str> {
        self.mechanisms.iter().map(|m| m.name()).collect()
    }

    /// Consume complete lines from `acc` until a terminal state or until
    /// no full line remains. Returns the bytes to send back.
    ///
    /// Bytes following the final `BEGIN` are left in `acc`.
    ///
    /// # Errors
    ///
    /// `LineTooLong` if the client sends an oversized line.
    pub fn feed(&mut self, acc: &mut ByteAccumulator) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        if !self.saw_first_byte {
            // the client may open with a single credentials NUL byte
            match acc.as_slice().first() {
                Some(0) => acc.skip(1)?,
                Some(_) => {}
                None => return Ok(out),
            }
            self.saw_first_byte = true;
        }
        while !self.is_finished() {
            let Some(line) = next_line(acc)? else {
                break;
            };
            if let Some(reply) = self.process_line(&line) {
                out.extend(encode_line(&reply));
            }
        }
        Ok(out)
    }

    /// Handle one line (without CRLF). Returns the reply line, if any.
    pub fn process_line(&mut self, line: &str) -> Option<String> {
        let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
        let command = tokens.first().copied().unwrap_or("");
        debug!(state = ?self.state, command, "auth line");

        match self.state {
            ServerState::WaitingForAuth => match command {
                "AUTH" => Some(self.handle_auth(&tokens)),
                "BEGIN" => {
                    self.state = ServerState::Terminate;
                    None
                }
                "ERROR" => Some(self.reject()),
                _ => Some("ERROR Invalid command".to_owned()),
            },
            ServerState::WaitingForData => match command {
                "DATA" => Some(self.handle_data(&tokens)),
                "CANCEL" | "ERROR" => Some(self.abort()),
                "BEGIN" => {
                    warn!("BEGIN while waiting for DATA");
                    self.context = None;
                    self.state = ServerState::Terminate;
                    None
                }
                _ => Some("ERROR Invalid command".to_owned()),
            },
            ServerState::WaitingForBegin => match command {
                "BEGIN" => {
                    if let Some(ctx) = self.context.as_mut() {
                        ctx.completed();
                    }
                    self.context = None;
                    self.state = ServerState::DoneAuth;
                    debug!(mechanism = ?self.active, "authenticated");
                    None
                }
                "CANCEL" | "ERROR" => Some(self.abort()),
                _ => Some("ERROR Invalid command".to_owned()),
            },
            ServerState::Terminate | ServerState::DoneAuth => None,
        }
    }

    fn handle_auth(&mut self, tokens: &[&str]) -> String {
        let initial = match tokens.len() {
            1 => return self.reject(),
            2 => None,
            3 => match hex::decode(tokens[2]) {
                Ok(data) => Some(data),
                Err(_) => return "ERROR Invalid initial response data".to_owned(),
            },
            _ => return "ERROR Invalid AUTH command".to_owned(),
        };
        let name = tokens[1];
        let Some(mechanism) = self.mechanisms.iter().find(|m| m.name() == name) else {
            debug!(mechanism = name, "unsupported mechanism");
            return self.reject();
        };
        let (response, ctx) = mechanism.start(initial.as_deref());
        self.active = Some(name.to_owned());
        self.context = Some(ctx);
        self.step(response)
    }

    fn handle_data(&mut self, tokens: &[&str]) -> String {
        let payload = match tokens.len() {
            1 => Vec::new(),
            2 => match hex::decode(tokens[1]) {
                Ok(data) => data,
                Err(_) => return "ERROR Invalid response data".to_owned(),
            },
            _ => return "ERROR Invalid DATA command".to_owned(),
        };
        let response = match self.context.as_mut() {
            Some(ctx) => ctx.data(&payload),
            None => MechResponse::Reject,
        };
        self.step(response)
    }

    fn step(&mut self, response: MechResponse) -> String {
        match response {
            MechResponse::Continue(challenge) => {
                self.state = ServerState::WaitingForData;
                if challenge.is_empty() {
                    "DATA".to_owned()
                } else {
                    format!("DATA {}", hex::encode(challenge))
                }
            }
            MechResponse::Ok => {
                self.state = ServerState::WaitingForBegin;
                format!("OK {}", self.guid)
            }
            MechResponse::Reject => {
                self.context = None;
                self.reject()
            }
        }
    }

    fn abort(&mut self) -> String {
        if let Some(mut ctx) = self.context.take() {
            ctx.aborted();
        }
        self.reject()
    }

    fn reject(&mut self) -> String {
        self.state = ServerState::WaitingForAuth;
        self.active = None;
        let names = self.mechanism_names().join(" ");
        format!("REJECT {names}")
    }
}
