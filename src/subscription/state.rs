//! Per-resource-name state table (component A).

use std::collections::HashMap;
use std::collections::hash_map::Iter;

/// The state of a single resource name within a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceState {
    /// Subscribed but no version has been received yet, or the server
    /// explicitly removed it.
    Waiting,
    /// The last version acknowledged from the server.
    Known {
        /// The server-assigned version string.
        version: String,
    },
}

impl ResourceState {
    /// Returns the known version, if any.
    pub fn version(&self) -> Option<&str> {
        match self {
            ResourceState::Known { version } => Some(version.as_str()),
            ResourceState::Waiting => None,
        }
    }
}

/// Maps resource name to [`ResourceState`].
///
/// A name appears in the table iff the user currently has interest in it, or
/// the server last reported it removed (it then stays `Waiting` until the
/// user drops interest — see spec §4.5).
#[derive(Debug, Default)]
pub struct ResourceTable {
    entries: HashMap<String, ResourceState>,
}

impl ResourceTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a name's current state.
    pub fn get(&self, name: &str) -> Option<&ResourceState> {
        self.entries.get(name)
    }

    /// Set a name to `Waiting`, overwriting any prior state.
    pub fn set_waiting(&mut self, name: impl Into<String>) {
        self.entries.insert(name.into(), ResourceState::Waiting);
    }

    /// Set a name to `Known { version }`, overwriting any prior state.
    pub fn set_known(&mut self, name: impl Into<String>, version: impl Into<String>) {
        self.entries.insert(
            name.into(),
            ResourceState::Known {
                version: version.into(),
            },
        );
    }

    /// Remove a name entirely.
    pub fn remove(&mut self, name: &str) {
        self.entries.remove(name);
    }

    /// Whether the table has an entry for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Iterate over all entries in unspecified order.
    pub fn iter(&self) -> Iter<'_, String, ResourceState> {
        self.entries.iter()
    }

    /// Number of entries currently tracked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_known_overwrites_waiting() {
        let mut table = ResourceTable::new();
        table.set_waiting("a");
        assert_eq!(table.get("a"), Some(&ResourceState::Waiting));
        table.set_known("a", "v1");
        assert_eq!(
            table.get("a"),
            Some(&ResourceState::Known {
                version: "v1".into()
            })
        );
    }

    #[test]
    fn remove_clears_entry() {
        let mut table = ResourceTable::new();
        table.set_known("a", "v1");
        table.remove("a");
        assert_eq!(table.get("a"), None);
        assert!(!table.contains("a"));
    }
}
