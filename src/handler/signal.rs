//! Signal routing by match rule.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::connection::Connection;
use crate::error::Result;
use crate::protocol::{Frame, MessageKind, ObjectPath};

/// Predicate selecting frames by kind, interface, member and path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchRule {
    kind: MessageKind,
    interface: String,
    member: String,
    path: ObjectPath,
}

impl MatchRule {
    /// Rule matching one signal.
    pub fn signal(path: &str, interface: &str, member: &str) -> Result<Self> {
        Ok(Self {
            kind: MessageKind::Signal,
            interface: interface.to_owned(),
            member: member.to_owned(),
            path: ObjectPath::new(path)?,
        })
    }

    /// The rule a frame would match exactly, if it has all the fields.
    pub fn for_frame(frame: &Frame) -> Option<Self> {
        Some(Self {
            kind: frame.kind(),
            interface: frame.interface()?.to_owned(),
            member: frame.member()?.to_owned(),
            path: ObjectPath::new(frame.path()?).ok()?,
        })
    }

    #[inline]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    #[inline]
    pub fn interface(&self) -> &str {
        &self.interface
    }

    #[inline]
    pub fn member(&self) -> &str {
        &self.member
    }

    #[inline]
    pub fn path(&self) -> &ObjectPath {
        &self.path
    }
}

/// Renders the bus daemon's `AddMatch` syntax.
impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type='{}',interface='{}',member='{}',path='{}'",
            self.kind.as_str(),
            self.interface,
            self.member,
            self.path
        )
    }
}

/// Callback invoked for a matching signal.
pub type SignalHandler = Rc<dyn Fn(&mut Connection, &Frame) -> Result<()>>;

/// Registry of signal handlers. Several handlers may share a rule; they
/// run in registration order.
#[derive(Default)]
pub struct SignalRegistry {
    handlers: HashMap<MatchRule, Vec<SignalHandler>>,
}

impl fmt::Debug for SignalRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalRegistry")
            .field("rules", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler for `rule`.
    pub fn add<F>(&mut self, rule: MatchRule, handler: F)
    where
        F: Fn(&mut Connection, &Frame) -> Result<()> + 'static,
    {
        self.handlers.entry(rule).or_default().push(Rc::new(handler));
    }

    /// Remove every handler for `rule`. Returns whether any existed.
    pub fn remove(&mut self, rule: &MatchRule) -> bool {
        self.handlers.remove(rule).is_some()
    }

    /// Handlers matching `frame`, cloned so the caller may release the
    /// registry before invoking them.
    pub fn matching(&self, frame: &Frame) -> Vec<SignalHandler> {
        MatchRule::for_frame(frame)
            .and_then(|rule| self.handlers.get(&rule).cloned())
            .unwrap_or_default()
    }

    pub fn contains(&self, rule: &MatchRule) -> bool {
        self.handlers.contains_key(rule)
    }

    /// Number of distinct rules.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
