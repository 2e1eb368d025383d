//! The non-caching `SessionCache` strategy (spec.md §4.3 "Null").
//!
//! Never retains a Session across calls: every `get` re-loads from the
//! store and every `put` writes through immediately. Useful when
//! cross-request sharing of a Session object must be forbidden.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use session_core::{Error, ListenerEvent, ListenerHandle, Result, Session, SessionContext};
use session_store::SessionDataStore;

use crate::SessionCache;

pub struct NullSessionCache {
    store: Arc<dyn SessionDataStore>,
    listeners: ListenerHandle,
    context: SessionContext,
}

impl NullSessionCache {
    pub fn new(store: Arc<dyn SessionDataStore>, listeners: ListenerHandle, context: SessionContext) -> Self {
        Self { store, listeners, context }
    }
}

#[async_trait]
impl SessionCache for NullSessionCache {
    async fn get(&self, id: &str, _now: i64) -> Result<Option<Arc<Session>>> {
        Ok(self.store.load(id).await?.map(|data| Arc::new(Session::new(data))))
    }

    async fn put(&self, id: String, session: Arc<Session>) -> Result<()> {
        let mut data = session.snapshot().await?;
        self.store.store(&id, &mut data, data.last_saved, data.accessed).await?;
        self.listeners
            .dispatch(ListenerEvent::SessionCreated { key: self.context.key(id) })
            .await;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<Option<Arc<Session>>> {
        let existing = self.store.load(id).await?.map(|data| Arc::new(Session::new(data)));
        if let Some(session) = &existing {
            session.invalidate().await;
        }
        self.store.delete(id).await?;
        self.listeners
            .dispatch(ListenerEvent::SessionDestroyed { key: self.context.key(id) })
            .await;
        Ok(existing)
    }

    async fn check_expiration(&self, candidates: &HashSet<String>, now: i64) -> Result<HashSet<String>> {
        self.store.get_expired(candidates, now).await
    }

    async fn renew_session_id(&self, old_id: &str, new_id: &str, now: i64) -> Result<()> {
        let mut data = self.store.load(old_id).await?.ok_or(Error::NotFound)?;
        data.id = new_id.to_string();
        data.meta_data_dirty = true;
        self.store.store(new_id, &mut data, 0, now).await?;
        self.store.delete(old_id).await?;
        self.listeners
            .dispatch(ListenerEvent::IdChanged {
                old_id: old_id.to_string(),
                new_key: self.context.key(new_id),
            })
            .await;
        Ok(())
    }

    async fn passivate_idle_session(&self, _id: &str, _now: i64) -> Result<()> {
        // Nothing is ever resident, so there is nothing to passivate.
        Ok(())
    }

    async fn evict_on_exit(&self, _id: &str, _now: i64) -> Result<()> {
        // Nothing is ever resident, so there is nothing to evict.
        Ok(())
    }

    async fn len(&self) -> usize {
        0
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use session_core::SessionData;
    use session_store::memory::MemoryStore;

    fn cache() -> NullSessionCache {
        NullSessionCache::new(
            Arc::new(MemoryStore::new()),
            ListenerHandle::new(),
            SessionContext::new("", "/app", "host-a"),
        )
    }

    #[tokio::test]
    async fn two_sequential_gets_return_distinct_objects() {
        let cache = cache();
        let data = SessionData::new("s6", "_app", "host-a", 0, 60_000);
        cache.put("s6".into(), Arc::new(Session::new(data))).await.unwrap();

        let a = cache.get("s6", 1).await.unwrap().unwrap();
        let b = cache.get("s6", 1).await.unwrap().unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
    }
}
