//! The caching `SessionCache` strategy (spec.md §4.3 "Default").

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use session_core::{Error, ListenerEvent, ListenerHandle, Result, Session, SessionContext, SessionKey};
use session_store::SessionDataStore;
use tokio::sync::Mutex as AsyncMutex;

use crate::staleness::StalenessPolicy;
use crate::{EvictionPolicy, SessionCache, MAX_SHUTDOWN_SWEEP_PASSES};

/// Keeps Session objects resident according to `EvictionPolicy`, consulting
/// the store on miss and on stale-check hits. Concurrent `get`s for the same
/// uncached id collapse to a single store load via a per-id load lock,
/// matching spec.md §8 scenario 5.
pub struct DefaultSessionCache {
    sessions: DashMap<String, Arc<Session>>,
    load_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    /// Tracks each resident id's last-known expiry timestamp, so the
    /// HouseKeeper can ask for "ids whose next expiry is near" without
    /// scanning the whole `sessions` map (spec.md §4.6).
    tracked_expiry: DashMap<String, i64>,
    store: Arc<dyn SessionDataStore>,
    listeners: ListenerHandle,
    context: SessionContext,
    eviction_policy: EvictionPolicy,
    staleness: StalenessPolicy,
}

impl DefaultSessionCache {
    pub fn new(
        store: Arc<dyn SessionDataStore>,
        listeners: ListenerHandle,
        context: SessionContext,
        eviction_policy: EvictionPolicy,
        staleness: StalenessPolicy,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            load_locks: DashMap::new(),
            tracked_expiry: DashMap::new(),
            store,
            listeners,
            context,
            eviction_policy,
            staleness,
        }
    }

    fn key(&self, id: &str) -> SessionKey {
        self.context.key(id)
    }

    async fn evict_and_fire_destroyed(&self, id: &str) {
        if let Some((_, session)) = self.sessions.remove(id) {
            session.invalidate().await;
        }
        self.tracked_expiry.remove(id);
        self.listeners
            .dispatch(ListenerEvent::SessionDestroyed { key: self.key(id) })
            .await;
    }
}

#[async_trait]
impl SessionCache for DefaultSessionCache {
    #[tracing::instrument(skip(self), err)]
    async fn get(&self, id: &str, now: i64) -> Result<Option<Arc<Session>>> {
        if let Some(session) = self.sessions.get(id).map(|e| e.clone()) {
            let snapshot = session.snapshot().await?;
            if self.staleness.is_stale(snapshot.last_saved, now) {
                tracing::debug!(id, "evicting stale cached session, forcing reload");
                self.sessions.remove(id);
                self.tracked_expiry.remove(id);
            } else {
                self.tracked_expiry.insert(id.to_string(), snapshot.expiry);
                tracing::trace!(id, "session cache hit");
                return Ok(Some(session));
            }
        }

        let lock = self
            .load_locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Re-check: another task may have completed the load while we
        // waited for the lock.
        if let Some(session) = self.sessions.get(id).map(|e| e.clone()) {
            return Ok(Some(session));
        }

        tracing::trace!(id, "session cache miss, loading from store");
        match self.store.load(id).await {
            Ok(Some(data)) => {
                self.tracked_expiry.insert(id.to_string(), data.expiry);
                let session = Arc::new(Session::new(data));
                self.sessions.insert(id.to_string(), session.clone());
                Ok(Some(session))
            }
            Ok(None) => Ok(None),
            Err(Error::Unreadable(msg)) => {
                tracing::warn!(id, msg, "session record unreadable; treating as absent");
                Err(Error::Unreadable(msg))
            }
            Err(err) => Err(err),
        }
    }

    async fn put(&self, id: String, session: Arc<Session>) -> Result<()> {
        self.sessions.insert(id.clone(), session);
        self.listeners
            .dispatch(ListenerEvent::SessionCreated { key: self.key(&id) })
            .await;
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    async fn delete(&self, id: &str) -> Result<Option<Arc<Session>>> {
        let existing = self.sessions.remove(id).map(|(_, s)| s);
        if let Some(session) = &existing {
            session.invalidate().await;
        }
        self.tracked_expiry.remove(id);
        if let Err(err) = self.store.delete(id).await {
            tracing::error!(id, error = %err, "store delete failed after cache removal");
        }
        self.listeners
            .dispatch(ListenerEvent::SessionDestroyed { key: self.key(id) })
            .await;
        Ok(existing)
    }

    #[tracing::instrument(skip(self, candidates), err)]
    async fn check_expiration(&self, candidates: &HashSet<String>, now: i64) -> Result<HashSet<String>> {
        let confirmed = self.store.get_expired(candidates, now).await?;
        for id in &confirmed {
            if self.sessions.contains_key(id) {
                self.evict_and_fire_destroyed(id).await;
            }
        }
        Ok(confirmed)
    }

    #[tracing::instrument(skip(self), err)]
    async fn renew_session_id(&self, old_id: &str, new_id: &str, now: i64) -> Result<()> {
        let session = match self.sessions.remove(old_id).map(|(_, s)| s) {
            Some(session) => session,
            None => match self.store.load(old_id).await? {
                Some(data) => Arc::new(Session::new(data)),
                None => return Err(Error::NotFound),
            },
        };

        session
            .with_data_mut(|data| {
                data.id = new_id.to_string();
                data.meta_data_dirty = true;
            })
            .await?;

        let mut data = session.snapshot().await?;
        self.store.store(new_id, &mut data, 0, now).await?;
        if let Err(err) = self.store.delete(old_id).await {
            tracing::error!(old_id, error = %err, "failed to delete old id after renew");
        }

        self.tracked_expiry.remove(old_id);
        self.tracked_expiry.insert(new_id.to_string(), data.expiry);
        self.sessions.insert(new_id.to_string(), session);
        self.listeners
            .dispatch(ListenerEvent::IdChanged {
                old_id: old_id.to_string(),
                new_key: self.key(new_id),
            })
            .await;
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    async fn passivate_idle_session(&self, id: &str, now: i64) -> Result<()> {
        let EvictionPolicy::OnInactivity(idle_timeout_sec) = self.eviction_policy else {
            return Ok(());
        };

        let Some(session) = self.sessions.get(id).map(|e| e.clone()) else {
            return Ok(());
        };

        let mut data = session.snapshot().await?;
        let idle_ms = now.saturating_sub(data.accessed);
        if idle_ms < (idle_timeout_sec as i64) * 1_000 {
            return Ok(());
        }

        if data.dirty || data.meta_data_dirty {
            self.store.store(id, &mut data, data.last_saved, now).await?;
        }
        self.sessions.remove(id);
        self.tracked_expiry.remove(id);
        tracing::debug!(id, "passivated idle session");
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    async fn evict_on_exit(&self, id: &str, now: i64) -> Result<()> {
        if self.eviction_policy != EvictionPolicy::OnSessionExit {
            return Ok(());
        }

        let Some(session) = self.sessions.get(id).map(|e| e.clone()) else {
            return Ok(());
        };
        if session.ref_count() > 0 {
            return Ok(());
        }

        let mut data = session.snapshot().await?;
        if data.dirty || data.meta_data_dirty {
            self.store.store(id, &mut data, data.last_saved, now).await?;
        }
        self.sessions.remove(id);
        self.tracked_expiry.remove(id);
        tracing::debug!(id, "evicted session on request exit");
        Ok(())
    }

    async fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Drains tracked ids whose last-known expiry is at or before `now`.
    /// Entries for ids still resident but not yet near expiry are left in
    /// place for a later tick.
    async fn collect_expiry_candidates(&self, now: i64) -> HashSet<String> {
        let due: Vec<String> = self
            .tracked_expiry
            .iter()
            .filter(|e| *e.value() <= now)
            .map(|e| e.key().clone())
            .collect();
        for id in &due {
            self.tracked_expiry.remove(id);
        }
        due.into_iter().collect()
    }

    #[tracing::instrument(skip(self), err)]
    async fn shutdown(&self) -> Result<()> {
        for pass in 0..MAX_SHUTDOWN_SWEEP_PASSES {
            if self.sessions.is_empty() {
                break;
            }
            let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
            for id in ids {
                if let Some((_, session)) = self.sessions.remove(&id) {
                    if let Ok(mut data) = session.snapshot().await {
                        if data.dirty || data.meta_data_dirty {
                            if let Err(err) = self.store.store(&id, &mut data, data.last_saved, data.accessed).await {
                                tracing::error!(id, error = %err, "failed to write dirty session through at shutdown");
                            }
                        }
                    }
                }
            }
            tracing::debug!(pass, "shutdown sweep pass complete");
        }
        self.tracked_expiry.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use session_core::SessionData;
    use session_store::memory::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache(store: Arc<dyn SessionDataStore>) -> DefaultSessionCache {
        DefaultSessionCache::new(
            store,
            ListenerHandle::new(),
            SessionContext::new("node-a", "/app", "host-a"),
            EvictionPolicy::Never,
            StalenessPolicy::new(0),
        )
    }

    #[tokio::test]
    async fn get_loads_from_store_on_miss() {
        let store = Arc::new(MemoryStore::new());
        let mut data = SessionData::new("s1", "_app", "host-a", 0, 60_000);
        store.store("s1", &mut data, 0, 0).await.unwrap();

        let cache = cache(store);
        let session = cache.get("s1", 1).await.unwrap();
        assert!(session.is_some());
    }

    #[tokio::test]
    async fn concurrent_get_on_miss_issues_one_load() {
        struct CountingStore {
            inner: MemoryStore,
            loads: AtomicUsize,
        }

        #[async_trait]
        impl SessionDataStore for CountingStore {
            async fn initialize(&self, ctx: &SessionContext) -> Result<()> {
                self.inner.initialize(ctx).await
            }
            async fn load(&self, id: &str) -> Result<Option<SessionData>> {
                self.loads.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                self.inner.load(id).await
            }
            async fn store(&self, id: &str, data: &mut SessionData, last: i64, now: i64) -> Result<()> {
                self.inner.store(id, data, last, now).await
            }
            async fn delete(&self, id: &str) -> Result<bool> {
                self.inner.delete(id).await
            }
            async fn exists(&self, id: &str, now: i64) -> Result<bool> {
                self.inner.exists(id, now).await
            }
            async fn get_expired(&self, c: &HashSet<String>, now: i64) -> Result<HashSet<String>> {
                self.inner.get_expired(c, now).await
            }
            fn is_passivating(&self) -> bool {
                false
            }
        }

        impl std::fmt::Debug for CountingStore {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct("CountingStore").finish()
            }
        }

        let inner = MemoryStore::new();
        let mut data = SessionData::new("s5", "_app", "host-a", 0, 60_000);
        inner.store("s5", &mut data, 0, 0).await.unwrap();

        let store: Arc<dyn SessionDataStore> = Arc::new(CountingStore { inner, loads: AtomicUsize::new(0) });
        let cache = Arc::new(cache(store.clone()));

        let c1 = cache.clone();
        let c2 = cache.clone();
        let (a, b) = tokio::join!(c1.get("s5", 1), c2.get("s5", 1));

        assert!(Arc::ptr_eq(&a.unwrap().unwrap(), &b.unwrap().unwrap()));
    }

    #[tokio::test]
    async fn renew_session_id_preserves_the_same_session_object() {
        let store: Arc<dyn SessionDataStore> = Arc::new(MemoryStore::new());
        let mut data = SessionData::new("A", "_app", "host-a", 0, 60_000);
        store.store("A", &mut data, 0, 0).await.unwrap();

        let cache = cache(store);
        let original = cache.get("A", 1).await.unwrap().unwrap();

        cache.renew_session_id("A", "B", 2).await.unwrap();

        assert!(cache.get("A", 3).await.unwrap().is_none());
        let renamed = cache.get("B", 3).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&original, &renamed));
    }

    #[tokio::test]
    async fn evict_on_exit_removes_once_ref_count_is_zero() {
        let store: Arc<dyn SessionDataStore> = Arc::new(MemoryStore::new());
        let mut data = SessionData::new("s7", "_app", "host-a", 0, 60_000);
        store.store("s7", &mut data, 0, 0).await.unwrap();

        let cache = DefaultSessionCache::new(
            store,
            ListenerHandle::new(),
            SessionContext::new("node-a", "/app", "host-a"),
            EvictionPolicy::OnSessionExit,
            StalenessPolicy::new(0),
        );

        let session = cache.get("s7", 1).await.unwrap().unwrap();
        session.access(1).await.unwrap();

        // Still referenced: evict_on_exit is a no-op.
        cache.evict_on_exit("s7", 2).await.unwrap();
        assert_eq!(cache.len().await, 1);

        session.complete();
        cache.evict_on_exit("s7", 2).await.unwrap();
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn evict_on_exit_is_noop_under_never_policy() {
        let store: Arc<dyn SessionDataStore> = Arc::new(MemoryStore::new());
        let mut data = SessionData::new("s8", "_app", "host-a", 0, 60_000);
        store.store("s8", &mut data, 0, 0).await.unwrap();

        let cache = cache(store);
        cache.get("s8", 1).await.unwrap();
        cache.evict_on_exit("s8", 2).await.unwrap();
        assert_eq!(cache.len().await, 1);
    }
}
