//! The persistable `SessionData` record (spec.md §3).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single attribute entry.
///
/// `server_scope` mirrors the Jetty-lineage "load with server classpath vs
/// application classpath" boolean (spec.md §4.1). Implementations with no
/// multi-classpath distinction — this one included — only ever write
/// `false`, but the field is round-tripped so records written by a
/// multi-classpath peer stay intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeEntry {
    pub server_scope: bool,
    pub value: Value,
}

impl AttributeEntry {
    pub fn application(value: Value) -> Self {
        Self {
            server_scope: false,
            value,
        }
    }
}

pub type Attributes = HashMap<String, AttributeEntry>;

/// The durable, per-session record (spec.md §3).
///
/// Invariants upheld by every mutator in this crate:
/// `created <= last_accessed <= accessed`;
/// `expiry == 0` iff `max_inactive_ms <= 0`, else `expiry == accessed +
/// max_inactive_ms` immediately after [`SessionData::touch`];
/// `last_saved > 0` iff at least one successful store has occurred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    pub id: String,
    pub context_path: String,
    pub vhost: String,
    pub last_node: String,
    pub created: i64,
    pub accessed: i64,
    pub last_accessed: i64,
    pub cookie_set: i64,
    pub last_saved: i64,
    /// Absolute expiry time in ms since epoch. `0` means "never expires".
    pub expiry: i64,
    /// Configured idle timeout in ms. `<= 0` means immortal.
    pub max_inactive_ms: i64,
    pub attributes: Attributes,
    /// True iff attributes changed since last save.
    pub dirty: bool,
    /// True iff non-attribute fields changed since last save.
    pub meta_data_dirty: bool,
}

impl SessionData {
    /// Construct a brand-new record at creation time `now`.
    pub fn new(
        id: impl Into<String>,
        context_path: impl Into<String>,
        vhost: impl Into<String>,
        now: i64,
        max_inactive_ms: i64,
    ) -> Self {
        let expiry = if max_inactive_ms > 0 {
            now + max_inactive_ms
        } else {
            0
        };

        Self {
            id: id.into(),
            context_path: context_path.into(),
            vhost: vhost.into(),
            last_node: String::new(),
            created: now,
            accessed: now,
            last_accessed: now,
            cookie_set: 0,
            last_saved: 0,
            expiry,
            max_inactive_ms,
            attributes: Attributes::new(),
            dirty: false,
            meta_data_dirty: true,
        }
    }

    /// Apply an access at time `now`: updates `accessed`/`last_accessed`/
    /// `expiry` and marks metadata dirty (spec.md §4.4 `access`).
    pub fn touch(&mut self, now: i64) {
        self.last_accessed = self.accessed;
        self.accessed = now;
        self.expiry = if self.max_inactive_ms > 0 {
            now + self.max_inactive_ms
        } else {
            0
        };
        self.meta_data_dirty = true;
    }

    /// `isExpiredAt` from spec.md §4.4/§8: immortal sessions never expire.
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.max_inactive_ms > 0 && self.expiry <= now
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: Value) {
        self.attributes
            .insert(name.into(), AttributeEntry::application(value));
        self.dirty = true;
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<AttributeEntry> {
        let removed = self.attributes.remove(name);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn get_attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name).map(|e| &e.value)
    }

    /// Stamp a successful store; clears both dirty flags.
    pub fn mark_saved(&mut self, now: i64) {
        self.last_saved = now;
        self.dirty = false;
        self.meta_data_dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immortal_session_never_expires() {
        let data = SessionData::new("id", "", "host", 1_000, 0);
        assert_eq!(data.expiry, 0);
        assert!(!data.is_expired_at(i64::MAX));
    }

    #[test]
    fn touch_recomputes_expiry_from_accessed() {
        let mut data = SessionData::new("id", "", "host", 1_000, 60_000);
        assert_eq!(data.expiry, 61_000);

        data.touch(5_000);
        assert_eq!(data.accessed, 5_000);
        assert_eq!(data.last_accessed, 1_000);
        assert_eq!(data.expiry, 65_000);
        assert!(data.meta_data_dirty);
    }

    #[test]
    fn expired_strictly_after_expiry() {
        let data = SessionData::new("id", "", "host", 0, 1_000);
        assert!(!data.is_expired_at(1_000));
        assert!(data.is_expired_at(1_001));
    }

    #[test]
    fn mark_saved_clears_dirty_flags() {
        let mut data = SessionData::new("id", "", "host", 0, 0);
        data.set_attribute("k", Value::String("v".into()));
        assert!(data.dirty);

        data.mark_saved(42);
        assert!(!data.dirty);
        assert!(!data.meta_data_dirty);
        assert_eq!(data.last_saved, 42);
    }
}
