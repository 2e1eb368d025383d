//! The per-context facade binding `SessionCache` + `SessionDataStore` +
//! `SessionIdManager` + listeners to request entry/exit (spec.md §4, §6
//! "External Interfaces").
//!
//! Grounded on the teacher's `SessionManager`/`SessionManagerLayer` tower
//! middleware (the vendored `tower-sessions` lineage's `sessions/service.rs`)
//! for the shape of a facade binding a store to request lifecycle,
//! generalized away from cookie/tower-specific concerns — this crate has no
//! HTTP dependency, matching spec.md's explicit non-goal of HTTP dispatch —
//! toward the explicit create/get/invalidate/renew operations spec.md §6
//! names.

mod lifecycle;

pub use lifecycle::ServerLifecycle;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use session_cache::SessionCache;
use session_core::{
    AttributeEntry, Error, ListenerEvent, ListenerHandle, ListenerToken, Result, Session,
    SessionContext, SessionData, SessionKey, SessionListener,
};
use session_id::{SessionHandler, SessionIdManager};
use session_store::SessionDataStore;

/// Per-context configuration the manager itself needs (spec.md §6). Policy
/// knobs that belong to the cache or store (`evictionPolicy`,
/// `stalePeriodSec`, `gracePeriodSec`, ...) are configured on those
/// components directly when the context is wired up; this struct only
/// holds what shapes the manager's own create/extend-id behavior.
#[derive(Debug, Clone, Copy)]
pub struct SessionManagerConfig {
    /// `maxInactiveIntervalSec` from spec.md §6. `<= 0` means immortal.
    pub max_inactive_sec: i64,
    /// Whether `extended_id` appends `.<workerName>` (spec.md §6
    /// `nodeIdInSessionId`).
    pub node_id_in_session_id: bool,
}

impl SessionManagerConfig {
    fn max_inactive_ms(&self) -> i64 {
        if self.max_inactive_sec > 0 {
            self.max_inactive_sec * 1_000
        } else {
            self.max_inactive_sec
        }
    }
}

/// Per-context facade. One instance per (contextPath, vhost), registered
/// with the server-wide `SessionIdManager` as a `SessionHandler`.
pub struct SessionManager {
    context: SessionContext,
    store: Arc<dyn SessionDataStore>,
    cache: Arc<dyn SessionCache>,
    id_manager: Arc<SessionIdManager>,
    listeners: ListenerHandle,
    config: SessionManagerConfig,
}

impl SessionManager {
    pub fn new(
        context: SessionContext,
        store: Arc<dyn SessionDataStore>,
        cache: Arc<dyn SessionCache>,
        id_manager: Arc<SessionIdManager>,
        listeners: ListenerHandle,
        config: SessionManagerConfig,
    ) -> Self {
        Self { context, store, cache, id_manager, listeners, config }
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// The key this manager registers itself under with the id manager: a
    /// context is uniquely identified by (contextPath, vhost).
    fn handler_key(&self) -> String {
        format!("{}@{}", self.context.canonical_context_path, self.context.vhost)
    }

    fn key(&self, id: &str) -> SessionKey {
        self.context.key(id)
    }

    /// Start order for this context: bind the store, then register with
    /// the server-wide id manager (spec.md §6: "DataStore -> Cache ->
    /// Manager ->..."; the cache itself needs no async start step beyond
    /// construction).
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.store.initialize(&self.context).await?;
        self.id_manager.register_handler(self.handler_key(), self.clone());
        Ok(())
    }

    /// Reverse of `start`: unregister, then sweep dirty sessions through
    /// and clear the cache.
    pub async fn stop(&self) -> Result<()> {
        self.id_manager.unregister_handler(&self.handler_key());
        self.cache.shutdown().await
    }

    /// Create-or-get a session for a request (spec.md §6). `requested_id`
    /// is the id the client presented, if any; reused only when the id
    /// manager reports it still in use somewhere.
    #[tracing::instrument(skip(self), err)]
    pub async fn create_or_get(&self, requested_id: Option<&str>, now: i64) -> Result<Arc<Session>> {
        if let Some(id) = requested_id {
            if let Some(session) = self.get(id, now).await? {
                return Ok(session);
            }
        }

        let id = self.id_manager.new_session_id(requested_id, now).await;
        let mut data = SessionData::new(
            &id,
            self.context.canonical_context_path.clone(),
            self.context.vhost.clone(),
            now,
            self.config.max_inactive_ms(),
        );
        data.last_node = self.context.worker_name.clone();

        // Publish to the cache only after the store confirms the write, so
        // no reader ever observes a session whose durable copy does not
        // exist (spec.md §5).
        self.store.store(&id, &mut data, 0, now).await?;
        let session = Arc::new(Session::new(data));
        self.cache.put(id.clone(), session.clone()).await?;
        Ok(session)
    }

    /// Retrieve an existing session by id; `None` if absent or expired
    /// (spec.md §6). A transient `Unreadable` error is treated per spec.md
    /// §4.8/§7: the id is invalidated across contexts and the request is
    /// served as if it presented no session.
    #[tracing::instrument(skip(self), err)]
    pub async fn get(&self, id: &str, now: i64) -> Result<Option<Arc<Session>>> {
        let session = match self.cache.get(id, now).await {
            Ok(session) => session,
            Err(Error::Unreadable(msg)) => {
                tracing::warn!(id, msg, "session unreadable; invalidating across contexts");
                self.id_manager.invalidate_all(id).await;
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let Some(session) = session else {
            return Ok(None);
        };

        if !session.access(now).await? {
            tracing::debug!(id, "session expired on access");
            self.invalidate(id).await?;
            return Ok(None);
        }

        Ok(Some(session))
    }

    /// Invalidate by id, fanning out across every other context that might
    /// share the same id (spec.md §6).
    #[tracing::instrument(skip(self), err)]
    pub async fn invalidate(&self, id: &str) -> Result<()> {
        self.cache.delete(id).await?;
        self.id_manager.invalidate_all(id).await;
        Ok(())
    }

    /// Renew id for post-authentication session-fixation defense (spec.md
    /// §6). Delegates minting and fan-out entirely to the id manager,
    /// which calls this manager's own `rename_locally` (below) along with
    /// every other registered context.
    #[tracing::instrument(skip(self))]
    pub async fn renew_id(&self, old_id: &str, now: i64) -> String {
        self.id_manager.renew_session_id(old_id, now).await
    }

    /// Request exit (spec.md §4.4 `complete()`). Decrements the ref count
    /// and, once it reaches zero, applies the cache's eviction policy.
    #[tracing::instrument(skip(self, session), err)]
    pub async fn complete_request(&self, id: &str, session: &Arc<Session>, now: i64) -> Result<()> {
        session.complete();
        self.cache.evict_on_exit(id, now).await
    }

    /// `getExtendedId` (spec.md §4.5/§6 `nodeIdInSessionId`).
    pub fn extended_id(&self, id: &str, dynamic_suffix: Option<&str>) -> String {
        if !self.config.node_id_in_session_id {
            return id.to_string();
        }
        self.id_manager.get_extended_id(id, dynamic_suffix)
    }

    pub async fn register_listener(&self, listener: Arc<dyn SessionListener>) -> ListenerToken {
        self.listeners.register(listener).await
    }

    /// Set an attribute, dispatching `AttributeAdded` or `AttributeReplaced`
    /// depending on whether a prior value existed (spec.md §6).
    #[tracing::instrument(skip(self, session, value), err)]
    pub async fn set_attribute(&self, id: &str, session: &Arc<Session>, name: &str, value: Value) -> Result<()> {
        let previous = session
            .with_data_mut(|data| {
                let previous = data.attributes.get(name).cloned();
                data.set_attribute(name, value.clone());
                previous
            })
            .await?;

        let new_entry = AttributeEntry::application(value);
        let event = match previous {
            Some(old) => ListenerEvent::AttributeReplaced {
                key: self.key(id),
                name: name.to_string(),
                old,
                new: new_entry,
            },
            None => ListenerEvent::AttributeAdded { key: self.key(id), name: name.to_string(), value: new_entry },
        };
        self.listeners.dispatch(event).await;
        Ok(())
    }

    /// Remove an attribute, dispatching `AttributeRemoved` only if one was
    /// actually present.
    #[tracing::instrument(skip(self, session), err)]
    pub async fn remove_attribute(&self, id: &str, session: &Arc<Session>, name: &str) -> Result<()> {
        let removed = session.with_data_mut(|data| data.remove_attribute(name)).await?;
        if let Some(value) = removed {
            self.listeners
                .dispatch(ListenerEvent::AttributeRemoved { key: self.key(id), name: name.to_string(), value })
                .await;
        }
        Ok(())
    }
}

#[async_trait]
impl SessionHandler for SessionManager {
    async fn is_id_in_use(&self, id: &str) -> bool {
        let now = now_ms_fallback();
        matches!(self.cache.get(id, now).await, Ok(Some(_)))
    }

    async fn invalidate_locally(&self, id: &str) {
        if let Err(err) = self.cache.delete(id).await {
            tracing::error!(id, error = %err, "local invalidation failed");
        }
    }

    async fn rename_locally(&self, old_id: &str, new_id: &str) -> Result<()> {
        let now = now_ms_fallback();
        self.cache.renew_session_id(old_id, new_id, now).await
    }
}

/// `is_id_in_use`/`rename_locally` are invoked by the id manager without an
/// explicit "now", since they answer a point-in-time membership question
/// rather than performing an access. Using wall-clock time here (rather
/// than requiring every caller to thread one through `SessionHandler`)
/// matches the id manager's own use of wall-clock time for minting.
fn now_ms_fallback() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use session_cache::{DefaultSessionCache, EvictionPolicy, StalenessPolicy};
    use session_store::memory::MemoryStore;

    fn manager() -> SessionManager {
        let store: Arc<dyn SessionDataStore> = Arc::new(MemoryStore::new());
        let listeners = ListenerHandle::new();
        let context = SessionContext::new("node-a", "/app", "host-a");
        let cache: Arc<dyn SessionCache> = Arc::new(DefaultSessionCache::new(
            store.clone(),
            listeners.clone(),
            context.clone(),
            EvictionPolicy::Never,
            StalenessPolicy::new(0),
        ));
        let id_manager = Arc::new(SessionIdManager::new("node-a", 0).unwrap());

        SessionManager::new(
            context,
            store,
            cache,
            id_manager,
            listeners,
            SessionManagerConfig { max_inactive_sec: 60, node_id_in_session_id: true },
        )
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let manager = manager();
        let session = manager.create_or_get(None, 0).await.unwrap();
        let data = session.snapshot().await.unwrap();

        let fetched = manager.get(&data.id, 1).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&session, &fetched));
    }

    #[tokio::test]
    async fn get_returns_none_once_expired_and_invalidates() {
        let manager = manager();
        let session = manager.create_or_get(None, 0).await.unwrap();
        let id = session.snapshot().await.unwrap().id;

        let missing = manager.get(&id, 1_000_000_000).await.unwrap();
        assert!(missing.is_none());
        assert!(manager.get(&id, 1_000_000_001).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_attribute_dispatches_added_then_replaced() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Counter(Arc<AtomicUsize>);
        #[async_trait]
        impl SessionListener for Counter {
            async fn on_event(&self, event: &ListenerEvent) {
                if matches!(event, ListenerEvent::AttributeAdded { .. } | ListenerEvent::AttributeReplaced { .. }) {
                    self.0.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        let manager = manager();
        let count = Arc::new(AtomicUsize::new(0));
        manager.register_listener(Arc::new(Counter(count.clone()))).await;

        let session = manager.create_or_get(None, 0).await.unwrap();
        let id = session.snapshot().await.unwrap().id;

        manager.set_attribute(&id, &session, "k", Value::String("v1".into())).await.unwrap();
        manager.set_attribute(&id, &session, "k", Value::String("v2".into())).await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 2);
        let data = session.snapshot().await.unwrap();
        assert_eq!(data.get_attribute("k").unwrap(), &Value::String("v2".into()));
    }

    #[tokio::test]
    async fn extended_id_respects_node_id_in_session_id() {
        let manager = manager();
        let session = manager.create_or_get(None, 0).await.unwrap();
        let id = session.snapshot().await.unwrap().id;

        assert!(manager.extended_id(&id, None).ends_with(".node-a"));
    }
}
