//! Pluggable authentication mechanisms.
//!
//! A [`Mechanism`] is a factory: each `AUTH` naming it starts a fresh
//! [`AuthContext`] holding that negotiation's state. The responder feeds
//! `DATA` payloads to the context and tells it when the exchange was
//! aborted or completed.

use std::fmt;
use std::rc::Rc;

/// Outcome of one mechanism step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MechResponse {
    /// Send this challenge and wait for more data.
    Continue(Vec<u8>),
    /// Credentials accepted.
    Ok,
    /// Credentials refused.
    Reject,
}

/// Per-negotiation state of a mechanism.
pub trait AuthContext {
    /// Handle a decoded `DATA` payload.
    fn data(&mut self, data: &[u8]) -> MechResponse;

    /// The client cancelled or errored out of this negotiation.
    fn aborted(&mut self) {}

    /// The client sent `BEGIN` after this context accepted.
    fn completed(&mut self) {}
}

/// Factory for [`AuthContext`]s, registered by name on the responder.
pub trait Mechanism {
    /// Mechanism name as it appears after `AUTH`.
    fn name(&self) -> &str;

    /// Start a negotiation with the optional hex-decoded initial response.
    fn start(&self, initial: Option<&[u8]>) -> (MechResponse, Box<dyn AuthContext>);
}

/// Identity check used by [`External`].
type IdentityCheck = Rc<dyn Fn(&str) -> bool>;

/// `EXTERNAL`: the client asserts an identity established out of band
/// (normally its numeric uid), and a predicate decides whether to trust it.
pub struct External {
    check: IdentityCheck,
}

impl External {
    pub fn new(check: impl Fn(&str) -> bool + 'static) -> Self {
        Self {
            check: Rc::new(check),
        }
    }

    /// Accept only the given numeric uid.
    pub fn for_uid(uid: u32) -> Self {
        let expected = uid.to_string();
        Self::new(move |identity| identity == expected)
    }

    /// Accept only the uid this process runs as.
    #[cfg(unix)]
    pub fn same_user() -> Self {
        Self::for_uid(nix::unistd::getuid().as_raw())
    }
}

impl fmt::Debug for External {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("External").finish_non_exhaustive()
    }
}

struct ExternalContext {
    check: IdentityCheck,
}

impl ExternalContext {
    fn verify(&self, data: &[u8]) -> MechResponse {
        match std::str::from_utf8(data) {
            Ok(identity) if (self.check)(identity) => MechResponse::Ok,
            _ => MechResponse::Reject,
        }
    }
}

impl AuthContext for ExternalContext {
    fn data(&mut self, data: &[u8]) -> MechResponse {
        self.verify(data)
    }
}

impl Mechanism for External {
    fn name(&self) -> &str {
        "EXTERNAL"
    }

    fn start(&self, initial: Option<&[u8]>) -> (MechResponse, Box<dyn AuthContext>) {
        let ctx = ExternalContext {
            check: self.check.clone(),
        };
        let response = match initial {
            Some(data) => ctx.verify(data),
            // ask for the identity with an empty challenge
            None => MechResponse::Continue(Vec::new()),
        };
        (response, Box::new(ctx))
    }
}

/// `ANONYMOUS`: accepts everyone. The initial response is trace text and
/// is ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct Anonymous;

struct AnonymousContext;

impl AuthContext for AnonymousContext {
    fn data(&mut self, _data: &[u8]) -> MechResponse {
        MechResponse::Ok
    }
}

impl Mechanism for Anonymous {
    fn name(&self) -> &str {
        "ANONYMOUS"
    }

    fn start(&self, _initial: Option<&[u8]>) -> (MechResponse, Box<dyn AuthContext>) {
        (MechResponse::Ok, Box::new(AnonymousContext))
    }
}
