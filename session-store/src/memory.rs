//! In-process `SessionDataStore` (spec.md §4.2).
//!
//! Grounded on the `MemoryStore` doc example in upstream
//! `tower-sessions-core::session_store` and on the teacher's own
//! in-memory-style locking idioms. `dashmap` backs the map, matching
//! spec.md §5's requirement for compare-and-insert / snapshot iteration on
//! an id-keyed table.

use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;
use session_core::{Error, Result, SessionContext, SessionData};

use crate::SessionDataStore;

/// Keeps a mapping `id -> SessionData` entirely in memory. Never persists
/// across process restarts; useful for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, SessionData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionDataStore for MemoryStore {
    async fn initialize(&self, _context: &SessionContext) -> Result<()> {
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<SessionData>> {
        // Passivating claims a deep copy is needed so callers can't mutate
        // the store's copy through the returned value; a plain clone of an
        // owned struct already gives us that regardless of whether this
        // store claims to passivate.
        Ok(self.records.get(id).map(|entry| entry.value().clone()))
    }

    async fn store(&self, id: &str, data: &mut SessionData, last_save_time: i64, now: i64) -> Result<()> {
        tracing::trace!(id, insert = last_save_time <= 0, "memory store: writing session");
        data.mark_saved(now);
        self.records.insert(id.to_string(), data.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.records.remove(id).is_some())
    }

    async fn exists(&self, id: &str, now: i64) -> Result<bool> {
        Ok(self
            .records
            .get(id)
            .map(|entry| !entry.is_expired_at(now))
            .unwrap_or(false))
    }

    async fn get_expired(&self, candidates: &HashSet<String>, now: i64) -> Result<HashSet<String>> {
        let mut expired: HashSet<String> = self
            .records
            .iter()
            .filter(|entry| entry.expiry > 0 && entry.expiry <= now)
            .map(|entry| entry.key().clone())
            .collect();

        // Orphans: candidates the caller believed expired but which are no
        // longer present at all are, by definition, expired-by-absence.
        for candidate in candidates {
            if !self.records.contains_key(candidate) {
                expired.insert(candidate.clone());
            }
        }

        Ok(expired)
    }

    fn is_passivating(&self) -> bool {
        false
    }
}

/// Convenience used by tests elsewhere in the workspace that want to assert
/// `NotFound` semantics explicitly rather than matching on `Option`.
pub async fn load_or_not_found(store: &MemoryStore, id: &str) -> Result<SessionData> {
    store.load(id).await?.ok_or(Error::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn sample(id: &str, expiry: i64) -> SessionData {
        let mut data = SessionData::new(id, "", "host", 0, 60_000);
        data.expiry = expiry;
        data
    }

    #[tokio::test]
    async fn store_then_load_round_trips() {
        let store = MemoryStore::new();
        let mut data = sample("s1", 60_000);
        store.store("s1", &mut data, 0, 1).await.unwrap();

        let loaded = store.load("s1").await.unwrap().unwrap();
        assert_eq!(loaded.id, "s1");
        assert_eq!(loaded.last_saved, 1);
    }

    #[tokio::test]
    async fn delete_then_exists_is_false() {
        let store = MemoryStore::new();
        let mut data = sample("s1", 60_000);
        store.store("s1", &mut data, 0, 1).await.unwrap();

        assert!(store.delete("s1").await.unwrap());
        assert!(!store.delete("s1").await.unwrap());
        assert!(!store.exists("s1", 2).await.unwrap());
    }

    #[tokio::test]
    async fn get_expired_finds_both_expired_and_orphaned() {
        let store = MemoryStore::new();
        let mut expired = sample("expired", 100);
        store.store("expired", &mut expired, 0, 0).await.unwrap();

        let mut fresh = sample("fresh", 1_000_000);
        store.store("fresh", &mut fresh, 0, 0).await.unwrap();

        let mut candidates = HashSet::new();
        candidates.insert("gone".to_string());

        let result = store.get_expired(&candidates, 500).await.unwrap();
        assert!(result.contains("expired"));
        assert!(result.contains("gone"));
        assert!(!result.contains("fresh"));
    }

    #[tokio::test]
    async fn empty_candidates_still_finds_self_discovered_expired() {
        let store = MemoryStore::new();
        let mut expired = sample("expired", 100);
        store.store("expired", &mut expired, 0, 0).await.unwrap();

        let result = store.get_expired(&HashSet::new(), 500).await.unwrap();
        assert_eq!(result.len(), 1);
        assert!(result.contains("expired"));
    }
}
