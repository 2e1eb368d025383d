//! The per-context `SessionCache` (spec.md §4.3).
//!
//! Grounded on the `RwLock`-guarded cache shape and dirty-tracking
//! `CacheEntry` in `arawn::cache`, generalized from LRU-with-TTL to the
//! spec's NEVER/ON_SESSION_EXIT/ON_INACTIVITY eviction policies and
//! store-confirmed expiry. `dashmap` again for put-if-absent semantics on
//! the identity table (spec.md §4.3/§5).

mod default_cache;
mod null_cache;
mod staleness;

pub use default_cache::DefaultSessionCache;
pub use null_cache::NullSessionCache;
pub use staleness::StalenessPolicy;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use session_core::{Result, Session};

/// How a `DefaultSessionCache` decides when to evict an idle, clean Session
/// from memory (spec.md §6 `evictionPolicy`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Never evict except on explicit invalidation/expiry.
    Never,
    /// Evict as soon as the request reference count returns to zero.
    OnSessionExit,
    /// Evict after this many seconds of inactivity (spec.md
    /// `idlePassivationTimeoutSec`).
    OnInactivity(u64),
}

/// Per-context in-memory owner of live `Session` objects (spec.md §4.3).
///
/// Implementations guarantee: for a given id, at most one `Session` is
/// cached at any instant, and concurrent `get`s for an uncached id collapse
/// to a single store load.
#[async_trait]
pub trait SessionCache: Send + Sync + 'static {
    /// Returns the cached Session, loading it from the store on miss. A
    /// stale cached entry is evicted and reloaded rather than returned.
    async fn get(&self, id: &str, now: i64) -> Result<Option<Arc<Session>>>;

    /// Insert/replace the cached Session for `id`. Used by `newSession` and
    /// by `renewSessionId`.
    async fn put(&self, id: String, session: Arc<Session>) -> Result<()>;

    /// Remove `id` from the cache AND from the backing store.
    async fn delete(&self, id: &str) -> Result<Option<Arc<Session>>>;

    /// Delegates to the store's `getExpired`, then for any still-cached
    /// entries that are actually expired, invalidates them (firing
    /// listener callbacks) before returning the confirmed id set.
    async fn check_expiration(&self, candidates: &HashSet<String>, now: i64) -> Result<HashSet<String>>;

    /// Drains and returns the set of resident ids whose tracked expiry has
    /// passed as of `now` (spec.md §4.6 candidate-expiry protocol: "caches
    /// accumulate a set of ids whose next expiry is near"). Consumed by the
    /// HouseKeeper tick, which then asks `check_expiration` to confirm.
    async fn collect_expiry_candidates(&self, now: i64) -> HashSet<String>;

    /// Atomically swap a session's identity within both cache and store.
    async fn renew_session_id(&self, old_id: &str, new_id: &str, now: i64) -> Result<()>;

    /// Evict `id` from memory if present and idle longer than the
    /// configured `idlePassivationTimeoutSec`, storing it first if dirty.
    async fn passivate_idle_session(&self, id: &str, now: i64) -> Result<()>;

    /// Called by the manager on request exit once the session's request
    /// ref count has reached zero. Under `EvictionPolicy::OnSessionExit`,
    /// writes the session through if dirty and evicts it from memory; a
    /// no-op under `Never`/`OnInactivity`, which manage eviction on their
    /// own schedule instead (spec.md §4.3 `evictionPolicy`).
    async fn evict_on_exit(&self, id: &str, now: i64) -> Result<()>;

    /// Number of sessions currently resident.
    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// At-shutdown sweep: write dirty sessions through and clear the cache.
    /// Bounded by `MAX_SHUTDOWN_SWEEP_PASSES` to avoid livelock from
    /// concurrent inserts racing the drain (spec.md §5).
    async fn shutdown(&self) -> Result<()>;
}

/// Bound on the at-shutdown dirty-writeback loop (spec.md §5, §6
/// "Bounded shutdown sweep").
pub const MAX_SHUTDOWN_SWEEP_PASSES: usize = 8;
