//! Object paths.

use std::fmt;

use crate::error::{BusError, Result};

/// A validated object path such as `/org/example/Thing`.
///
/// Valid paths start with `/`, have no trailing `/` (except the root
/// path itself) and consist of non-empty elements drawn from
/// `[A-Za-z0-9_]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPath(String);

impl ObjectPath {
    /// Validate and wrap `path`.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        Self::validate(&path)?;
        Ok(Self(path))
    }

    /// The root path `/`.
    pub fn root() -> Self {
        Self("/".to_owned())
    }

    /// Check path syntax without allocating.
    pub fn validate(path: &str) -> Result<()> {
        let invalid = || BusError::InvalidObjectPath(path.to_owned());
        let rest = path.strip_prefix('/').ok_or_else(invalid)?;
        if rest.is_empty() {
            return Ok(());
        }
        for element in rest.split('/') {
            if element.is_empty()
                || !element
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_')
            {
                return Err(invalid());
            }
        }
        Ok(())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the root path.
    #[inline]
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Path elements, empty for the root.
    pub fn elements(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|e| !e.is_empty())
    }

    /// Parent path, `None` for the root.
    pub fn parent(&self) -> Option<ObjectPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_owned())),
            None => None,
        }
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjectPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for ObjectPath {
    type Error = BusError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<String> for ObjectPath {
    type Error = BusError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}
