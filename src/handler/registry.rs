//! Object registry keyed by object path.
//!
//! Paths are stored in a trie of path elements. Nodes exist only on the
//! way to a registered object, so every child of a node leads somewhere
//! and introspection can list immediate children without scanning the
//! whole registry.
//!
//! # Example
//!
//! ```
//! use buswire::handler::{BusObject, ObjectRegistry};
//! use buswire::protocol::ObjectPath;
//!
//! let mut registry = ObjectRegistry::new();
//! registry.register(&ObjectPath::new("/a/b").unwrap(), BusObject::new());
//! registry.register(&ObjectPath::new("/a/c").unwrap(), BusObject::new());
//!
//! let children = registry.children(&ObjectPath::new("/a").unwrap());
//! assert_eq!(children, vec!["b", "c"]);
//! ```

use std::collections::BTreeMap;
use std::rc::Rc;

use super::object::{escape, BusObject};
use crate::error::{BusError, Result};
use crate::protocol::ObjectPath;

/// Document type line of introspection data.
pub const INTROSPECT_DOCTYPE: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n\"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n";

#[derive(Debug, Default)]
struct Node {
    object: Option<Rc<BusObject>>,
    children: BTreeMap<String, Node>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.object.is_none() && self.children.is_empty()
    }

    fn lookup(&self, path: &ObjectPath) -> Option<&Node> {
        path.elements()
            .try_fold(self, |node, element| node.children.get(element))
    }

    /// Remove the object at `elements`, pruning emptied nodes.
    fn remove(&mut self, elements: &[&str]) -> Option<Rc<BusObject>> {
        match elements.split_first() {
            None => self.object.take(),
            Some((first, rest)) => {
                let child = self.children.get_mut(*first)?;
                let removed = child.remove(rest);
                if child.is_empty() {
                    self.children.remove(*first);
                }
                removed
            }
        }
    }
}

/// Registry of exported objects.
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    root: Node,
    len: usize,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Export `object` at `path`, returning whatever was there before.
    pub fn register(&mut self, path: &ObjectPath, object: BusObject) -> Option<Rc<BusObject>> {
        let node = path.elements().fold(&mut self.root, |node, element| {
            node.children.entry(element.to_owned()).or_default()
        });
        let previous = node.object.replace(Rc::new(object));
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }

    /// Remove the object at `path`.
    ///
    /// # Errors
    ///
    /// `NotRegistered` if nothing is exported there.
    pub fn unregister(&mut self, path: &ObjectPath) -> Result<Rc<BusObject>> {
        let elements: Vec<&str> = path.elements().collect();
        let removed = self
            .root
            .remove(&elements)
            .ok_or_else(|| BusError::NotRegistered(path.to_string()))?;
        self.len -= 1;
        Ok(removed)
    }

    /// Object exported at exactly `path`.
    pub fn get(&self, path: &ObjectPath) -> Option<Rc<BusObject>> {
        self.root.lookup(path).and_then(|n| n.object.clone())
    }

    pub fn contains(&self, path: &ObjectPath) -> bool {
        self.root
            .lookup(path)
            .is_some_and(|n| n.object.is_some())
    }

    /// Immediate child elements of `path` that lead to exported objects,
    /// in sorted order.
    pub fn children(&self, path: &ObjectPath) -> Vec<&str> {
        self.root
            .lookup(path)
            .map(|n| n.children.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Number of exported objects.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Introspection document for `path`: the object's interfaces if one
    /// is exported there, plus a `<node>` per immediate child.
    ///
    /// Never calls into the objects' handlers.
    pub fn introspect(&self, path: &ObjectPath) -> String {
        let mut xml = String::from(INTROSPECT_DOCTYPE);
        xml.push_str(&format!("<node name=\"{}\">\n", escape(path.as_str())));
        if let Some(node) = self.root.lookup(path) {
            if let Some(object) = &node.object {
                object.write_introspection(&mut xml);
            }
            for child in node.children.keys() {
                xml.push_str(&format!("  <node name=\"{}\"/>\n", escape(child)));
            }
        }
        xml.push_str("</node>\n");
        xml
    }
}
