//! Process-wide start/stop ordering (spec.md §6: "Start order: DataStore ->
//! Cache -> Manager -> IdManager -> HouseKeeper. Stop order is the reverse,
//! with session shutdown... between Manager and Cache.").
//!
//! No direct pack analogue; this is a thin ordering helper over types this
//! workspace already defines, not a typestate machine — the spec only asks
//! for a specific call sequence, not a new abstraction.

use std::sync::Arc;

use session_core::Result;
use session_housekeeper::HouseKeeper;

use crate::SessionManager;

/// Owns the server-wide singletons (`SessionIdManager` via each manager,
/// `HouseKeeper`) plus every per-context `SessionManager`, and sequences
/// their start/stop per spec.md §6.
pub struct ServerLifecycle {
    managers: Vec<Arc<SessionManager>>,
    housekeeper: Arc<HouseKeeper>,
}

impl ServerLifecycle {
    pub fn new(managers: Vec<Arc<SessionManager>>, housekeeper: Arc<HouseKeeper>) -> Self {
        Self { managers, housekeeper }
    }

    /// DataStore -> Cache -> Manager happens inside `SessionManager::start`
    /// for each context (the cache itself has no async start step beyond
    /// construction); this method then starts the id manager's
    /// server-wide concerns — there are none beyond the handlers each
    /// manager just registered — and finally the HouseKeeper.
    pub async fn start(&self) -> Result<()> {
        for manager in &self.managers {
            manager.start().await?;
        }
        self.housekeeper.start().await;
        tracing::info!(contexts = self.managers.len(), "session subsystem started");
        Ok(())
    }

    /// Reverse order: HouseKeeper first (so no new scavenge tick starts
    /// mid-shutdown), then each manager, whose `stop` unregisters from the
    /// id manager and sweeps dirty sessions through before clearing its
    /// cache.
    pub async fn stop(&self) -> Result<()> {
        self.housekeeper.stop().await;
        for manager in self.managers.iter().rev() {
            manager.stop().await?;
        }
        tracing::info!("session subsystem stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use session_cache::{DefaultSessionCache, EvictionPolicy, SessionCache, StalenessPolicy};
    use session_core::{ListenerHandle, SessionContext};
    use session_id::SessionIdManager;
    use session_store::memory::MemoryStore;
    use session_store::SessionDataStore;
    use std::time::Duration;

    #[tokio::test]
    async fn start_then_stop_runs_without_error() {
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

        let manager = Arc::new(SessionManager::new(
            context,
            store,
            cache,
            id_manager.clone(),
            listeners,
            crate::SessionManagerConfig { max_inactive_sec: 60, node_id_in_session_id: false },
        ));

        let housekeeper = Arc::new(HouseKeeper::new(id_manager, Duration::from_secs(30)));
        let lifecycle = ServerLifecycle::new(vec![manager], housekeeper);

        lifecycle.start().await.unwrap();
        lifecycle.stop().await.unwrap();
    }
}
