use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("object has no metadata.name")]
    MissingName,
    #[error("malformed resource key: {0:?}")]
    Malformed(String),
}

/// Stable identity of a watched object: `namespace/name`, or `name` when the
/// object is cluster-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Result<Self, KeyError> {
        if name.is_empty() {
            return Err(KeyError::MissingName);
        }
        if name.contains('/') {
            return Err(KeyError::Malformed(name.to_string()));
        }
        match namespace {
            Some(ns) if !ns.is_empty() => {
                if ns.contains('/') {
                    return Err(KeyError::Malformed(format!("{}/{}", ns, name)));
                }
                Ok(Self(format!("{}/{}", ns, name)))
            }
            _ => Ok(Self(name.to_string())),
        }
    }

    /// Parse a key previously produced by [`ResourceKey::new`].
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        let parts: Vec<_> = s.split('/').collect();
        match parts.as_slice() {
            [name] => Self::new(None, name),
            [ns, name] if !ns.is_empty() => Self::new(Some(ns), name),
            _ => Err(KeyError::Malformed(s.to_string())),
        }
    }

    pub fn as_str(&self) -> &str { &self.0 }

    pub fn namespace(&self) -> Option<&str> {
        self.0.split_once('/').map(|(ns, _)| ns)
    }

    pub fn name(&self) -> &str {
        self.0.split_once('/').map(|(_, n)| n).unwrap_or(&self.0)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl AsRef<str> for ResourceKey {
    fn as_ref(&self) -> &str { &self.0 }
}
