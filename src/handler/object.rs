//! Exported objects and their method tables.
//!
//! Each [`BusObject`] lists, up front, the `(interface, member,
//! input signature)` triples it answers and a handler for each. Dispatch
//! is a table lookup; introspection reads the same table.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use bytes::Bytes;

use crate::codec::{split_first, Arg, BodyWriter};
use crate::connection::Connection;
use crate::error::{BusError, Result};
use crate::protocol::{Endian, Frame};

/// Error name for handler failures that carry no specific name.
pub const FAILED_ERROR: &str = "org.freedesktop.DBus.Error.Failed";

/// Error name for calls whose arguments do not decode.
pub const INVALID_ARGS_ERROR: &str = "org.freedesktop.DBus.Error.InvalidArgs";

/// Successful method result: a body and its signature.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    signature: String,
    body: Bytes,
}

impl Reply {
    /// Reply with no body.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Reply with a pre-encoded body.
    pub fn new(signature: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            signature: signature.into(),
            body: body.into(),
        }
    }

    /// Reply carrying basic values, encoded in `endian` (use the call's).
    pub fn args(endian: Endian, args: &[Arg]) -> Result<Self> {
        let mut w = BodyWriter::new(endian);
        let mut signature = String::new();
        for arg in args {
            w.write_arg(arg)?;
            signature.push_str(arg.signature());
        }
        Ok(Self::new(signature, w.into_bytes()))
    }

    #[inline]
    pub fn signature(&self) -> &str {
        &self.signature
    }

    #[inline]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Turn into a method-return frame answering `call`.
    pub fn into_frame(self, call: &Frame) -> Frame {
        Frame::method_return(call).with_body(&self.signature, self.body)
    }
}

/// Failed method result, sent back as an error reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodError {
    pub name: String,
    pub message: String,
}

impl MethodError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(INVALID_ARGS_ERROR, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(FAILED_ERROR, message)
    }
}

impl fmt::Display for MethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl From<BusError> for MethodError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Remote { name, message } => Self::new(name, message),
            BusError::Marshal(message) => Self::invalid_args(message),
            other => Self::failed(other.to_string()),
        }
    }
}

/// Result type for method handlers.
pub type MethodResult = std::result::Result<Reply, MethodError>;

/// Trait for method handlers.
///
/// Handlers receive the connection mutably so they can send frames or
/// make nested blocking calls.
pub trait MethodHandler {
    fn call(&self, conn: &mut Connection, call: &Frame) -> MethodResult;
}

impl<F> MethodHandler for F
where
    F: Fn(&mut Connection, &Frame) -> MethodResult,
{
    fn call(&self, conn: &mut Connection, call: &Frame) -> MethodResult {
        self(conn, call)
    }
}

/// One row of a method table.
#[derive(Clone)]
pub struct Method {
    interface: String,
    member: String,
    in_signature: String,
    out_signature: String,
    handler: Rc<dyn MethodHandler>,
}

impl Method {
    #[inline]
    pub fn interface(&self) -> &str {
        &self.interface
    }

    #[inline]
    pub fn member(&self) -> &str {
        &self.member
    }

    #[inline]
    pub fn in_signature(&self) -> &str {
        &self.in_signature
    }

    #[inline]
    pub fn out_signature(&self) -> &str {
        &self.out_signature
    }

    /// Shared handle to the handler, for calling without borrowing the table.
    pub fn handler(&self) -> Rc<dyn MethodHandler> {
        self.handler.clone()
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("interface", &self.interface)
            .field("member", &self.member)
            .field("in_signature", &self.in_signature)
            .field("out_signature", &self.out_signature)
            .finish_non_exhaustive()
    }
}

/// An object exported on a connection.
///
/// # Example
///
/// ```
/// use buswire::handler::{BusObject, Reply};
/// use buswire::codec::Arg;
///
/// let echo = BusObject::new().method("org.example.Echo", "Echo", "s", "s", |_conn, call| {
///     let text = call.body_reader().read_str()?.to_owned();
///     Ok(Reply::args(call.endian(), &[Arg::Str(text)])?)
/// });
/// assert_eq!(echo.methods().len(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct BusObject {
    methods: Vec<Method>,
}

impl BusObject {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a method. A later method with the same interface, member and
    /// input signature replaces the earlier one.
    pub fn method<H>(
        mut self,
        interface: &str,
        member: &str,
        in_signature: &str,
        out_signature: &str,
        handler: H,
    ) -> Self
    where
        H: Fn(&mut Connection, &Frame) -> MethodResult + 'static,
    {
        self.methods.retain(|m| {
            !(m.interface == interface && m.member == member && m.in_signature == in_signature)
        });
        self.methods.push(Method {
            interface: interface.to_owned(),
            member: member.to_owned(),
            in_signature: in_signature.to_owned(),
            out_signature: out_signature.to_owned(),
            handler: Rc::new(handler),
        });
        self
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    /// Find the method answering a call. A call without an interface
    /// matches any interface.
    pub fn find(&self, interface: Option<&str>, member: &str, signature: &str) -> Option<&Method> {
        self.methods.iter().find(|m| {
            m.member == member
                && m.in_signature == signature
                && interface.map_or(true, |i| i == m.interface)
        })
    }

    /// Append `<interface>` elements describing the method table.
    pub fn write_introspection(&self, xml: &mut String) {
        let mut by_interface: BTreeMap<&str, Vec<&Method>> = BTreeMap::new();
        for m in &self.methods {
            by_interface.entry(&m.interface).or_default().push(m);
        }
        for (interface, methods) in by_interface {
            xml.push_str(&format!("  <interface name=\"{}\">\n", escape(interface)));
            for m in methods {
                xml.push_str(&format!("    <method name=\"{}\">\n", escape(&m.member)));
                write_args(xml, &m.in_signature, "in");
                write_args(xml, &m.out_signature, "out");
                xml.push_str("    </method>\n");
            }
            xml.push_str("  </interface>\n");
        }
    }
}

fn write_args(xml: &mut String, signature: &str, direction: &str) {
    let mut rest = signature;
    while !rest.is_empty() {
        let (ty, tail) = split_first(rest).unwrap_or((rest, ""));
        xml.push_str(&format!(
            "      <arg type=\"{}\" direction=\"{direction}\"/>\n",
            escape(ty)
        ));
        rest = tail;
    }
}

pub(crate) fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_conn: &mut Connection, _call: &Frame) -> MethodResult {
        Ok(Reply::empty())
    }

    #[test]
    fn test_find_by_interface_member_signature() {
        let obj = BusObject::new()
            .method("org.example.A", "Get", "", "s", noop)
            .method("org.example.B", "Get", "u", "s", noop);
        assert_eq!(
            obj.find(Some("org.example.A"), "Get", "").unwrap().interface(),
            "org.example.A"
        );
        assert_eq!(obj.find(None, "Get", "u").unwrap().interface(), "org.example.B");
        assert!(obj.find(Some("org.example.A"), "Get", "u").is_none());
        assert!(obj.find(None, "Set", "").is_none());
    }

    #[test]
    fn test_method_replaces_same_key() {
        let obj = BusObject::new()
            .method("org.example.A", "Get", "", "s", noop)
            .method("org.example.A", "Get", "", "u", noop);
        assert_eq!(obj.methods().len(), 1);
        assert_eq!(obj.methods()[0].out_signature(), "u");
    }

    #[test]
    fn test_introspection_xml() {
        let obj = BusObject::new().method("org.example.A", "Add", "ii", "i", noop);
        let mut xml = String::new();
        obj.write_introspection(&mut xml);
        assert!(xml.contains("<interface name=\"org.example.A\">"));
        assert!(xml.contains("<method name=\"Add\">"));
        assert_eq!(xml.matches("direction=\"in\"").count(), 2);
        assert_eq!(xml.matches("direction=\"out\"").count(), 1);
    }

    #[test]
    fn test_reply_args_signature() {
        let reply = Reply::args(Endian::Little, &[Arg::Str("x".into()), Arg::Uint32(1)]).unwrap();
        assert_eq!(reply.signature(), "su");
        assert_eq!(reply.body().len(), 12);
    }

    #[test]
    fn test_method_error_from_bus_error() {
        let e: MethodError = BusError::Marshal("bad".into()).into();
        assert_eq!(e.name, INVALID_ARGS_ERROR);
        let e: MethodError = BusError::Remote {
            name: "x.Y".into(),
            message: "m".into(),
        }
        .into();
        assert_eq!(e.name, "x.Y");
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("a<b>&\"c\""), "a&lt;b&gt;&amp;&quot;c&quot;");
    }
}
