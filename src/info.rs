//! Per-stream info maps.
//!
//! Streams and their replicated resource descriptors carry a small
//! string→string map of session facts (stream management flags, client
//! hints). The map travels inside KV records and queue transfers, so it
//! is serde-serializable and order-stable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Info map key set by stream management when a session enables it.
pub const INFO_SM_ENABLED: &str = "sm.enabled";

/// An ordered string→string map with typed accessors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InfoMap {
    entries: BTreeMap<String, String>,
}

impl InfoMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }

    /// Interpret a key as a boolean; absent or non-"true" is false.
    pub fn bool_value(&self, key: &str) -> bool {
        self.get(key) == Some("true")
    }

    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) {
        self.set(key, if value { "true" } else { "false" });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for InfoMap {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
