//! The scheduled scavenger (spec.md §4.5 "HouseKeeper", §4.6 candidate-expiry
//! protocol).
//!
//! Grounded on the upstream `ExpiredDeletion::continuously_delete_expired`
//! `tokio::time::interval` scheduling idiom (from the vendored
//! `tower-sessions` lineage this workspace's `session-store` crate is
//! grounded on), generalized from single-store deletion to the spec's
//! candidate-union-then-confirm-then-fan-out protocol across many
//! per-context caches sharing one server-wide `SessionIdManager`.
//!
//! HouseKeeper is owned and lifecycle-coupled to the `SessionIdManager`
//! (spec.md §4.5): it holds a reference to it so a confirmed expiry can be
//! fanned out to every other context that might share the same id.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use session_cache::SessionCache;
use session_id::SessionIdManager;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

/// One registered context's cache, named for logging.
struct RegisteredContext {
    name: String,
    cache: Arc<dyn SessionCache>,
}

/// Scheduled scavenger. One instance per server, running at a configured
/// interval (spec.md §6 scheduling, `gracePeriodSec`-adjacent tuning lives
/// on the stores themselves).
pub struct HouseKeeper {
    interval: Duration,
    id_manager: Arc<SessionIdManager>,
    contexts: Mutex<Vec<RegisteredContext>>,
    task: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<Notify>,
}

impl HouseKeeper {
    pub fn new(id_manager: Arc<SessionIdManager>, interval: Duration) -> Self {
        Self {
            interval,
            id_manager,
            contexts: Mutex::new(Vec::new()),
            task: Mutex::new(None),
            stop: Arc::new(Notify::new()),
        }
    }

    /// Register a context's cache so its expiry candidates are swept on
    /// every tick. Must be called before [`HouseKeeper::start`] to be
    /// picked up by the first tick (later registrations are picked up on
    /// the next tick onward).
    pub async fn register_context(&self, name: impl Into<String>, cache: Arc<dyn SessionCache>) {
        self.contexts.lock().await.push(RegisteredContext { name: name.into(), cache });
    }

    pub async fn unregister_context(&self, name: &str) {
        self.contexts.lock().await.retain(|ctx| ctx.name != name);
    }

    /// Start the periodic scavenger task. A second call while already
    /// running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        let this = self.clone();
        let stop = self.stop.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            // The first tick fires immediately; skip it so the scavenger's
            // first real sweep happens one interval after start, matching
            // the teacher's `continuously_delete_expired` idiom.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.tick(now_ms()).await;
                    }
                    _ = stop.notified() => {
                        tracing::debug!("housekeeper scavenger task stopping");
                        break;
                    }
                }
            }
        }));
    }

    /// Cancel the scheduled task. In-flight store operations from a tick
    /// already underway are allowed to complete rather than being
    /// preempted (spec.md §5); this only prevents a *new* tick from
    /// starting.
    pub async fn stop(&self) {
        self.stop.notify_waiters();
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Run exactly one scavenge pass at the given time, useful for tests
    /// and for callers driving the schedule externally. Returns the union
    /// of ids confirmed expired across every registered context.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&self, now: i64) -> HashSet<String> {
        let contexts = self.contexts.lock().await;
        let mut all_confirmed = HashSet::new();

        for ctx in contexts.iter() {
            let candidates = ctx.cache.collect_expiry_candidates(now).await;
            tracing::trace!(context = ctx.name, candidates = candidates.len(), "scavenging context");

            let confirmed = match ctx.cache.check_expiration(&candidates, now).await {
                Ok(confirmed) => confirmed,
                Err(err) => {
                    tracing::error!(context = ctx.name, error = %err, "scavenge tick failed for context");
                    continue;
                }
            };

            for id in &confirmed {
                // Best-effort fan-out: an id is not considered globally
                // invalidated until every running context has acknowledged
                // (spec.md §5), which `expire_all` itself guarantees by
                // iterating every registered handler.
                self.id_manager.expire_all(id).await;
            }

            all_confirmed.extend(confirmed);
        }

        if !all_confirmed.is_empty() {
            tracing::debug!(count = all_confirmed.len(), "scavenge tick confirmed expired sessions");
        }
        all_confirmed
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use session_core::{Result, SessionContext, SessionData};
    use session_id::SessionHandler;
    use session_store::memory::MemoryStore;
    use std::sync::Arc;

    fn cache_with(store: Arc<dyn session_store::SessionDataStore>) -> Arc<dyn SessionCache> {
        Arc::new(session_cache::DefaultSessionCache::new(
            store,
            session_core::ListenerHandle::new(),
            SessionContext::new("", "/app", "host-a"),
            session_cache::EvictionPolicy::Never,
            session_cache::StalenessPolicy::new(0),
        ))
    }

    struct NoopHandler;

    #[async_trait]
    impl SessionHandler for NoopHandler {
        async fn is_id_in_use(&self, _id: &str) -> bool {
            false
        }
        async fn invalidate_locally(&self, _id: &str) {}
        async fn rename_locally(&self, _old_id: &str, _new_id: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn tick_confirms_expired_and_fans_out() {
        let store: Arc<dyn session_store::SessionDataStore> = Arc::new(MemoryStore::new());
        let mut data = SessionData::new("s1", "_app", "host-a", 0, 1_000);
        data.expiry = 1_000;
        store.store("s1", &mut data, 0, 0).await.unwrap();

        let cache = cache_with(store);
        // Prime the tracked-expiry set via a cache hit.
        cache.get("s1", 0).await.unwrap();

        let id_manager = Arc::new(SessionIdManager::new("", 0).unwrap());
        id_manager.register_handler("ctx", Arc::new(NoopHandler));

        let housekeeper = HouseKeeper::new(id_manager, Duration::from_secs(60));
        housekeeper.register_context("ctx", cache.clone()).await;

        let confirmed = housekeeper.tick(2_000).await;
        assert!(confirmed.contains("s1"));
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn start_and_stop_is_idempotent_and_cancellable() {
        let id_manager = Arc::new(SessionIdManager::new("", 0).unwrap());
        let housekeeper = Arc::new(HouseKeeper::new(id_manager, Duration::from_millis(20)));

        housekeeper.start().await;
        housekeeper.start().await; // no-op, already running
        tokio::time::sleep(Duration::from_millis(50)).await;
        housekeeper.stop().await;
    }
}
