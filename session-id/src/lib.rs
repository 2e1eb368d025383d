//! The server-wide `SessionIdManager` (spec.md §4.5).
//!
//! Grounded on the teacher's `SessionStore::new_id`
//! (`ChaCha20Rng::from_entropy`, `rand_core::RngCore`) for the CSPRNG
//! minting shape, generalized to the spec's worker-name/counter/extended-id
//! scheme and reseed-after-N-mints policy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore, SeedableRng};
use session_core::{Error, Result};
use tokio::sync::Mutex;

/// Implemented by each per-context facade that registers with the id
/// manager, so it can be asked "is this id in use" and told to invalidate
/// or rename locally (spec.md §4.5's cross-context fan-out).
#[async_trait]
pub trait SessionHandler: Send + Sync {
    async fn is_id_in_use(&self, id: &str) -> bool;
    async fn invalidate_locally(&self, id: &str);
    async fn rename_locally(&self, old_id: &str, new_id: &str) -> Result<()>;
}

/// Server-wide, exactly one per server (spec.md §4.5, §6).
pub struct SessionIdManager {
    worker_name: String,
    rng: Mutex<ChaCha20Rng>,
    mint_count: AtomicU64,
    reseed_after: u64,
    counter: AtomicU64,
    handlers: DashMap<String, Arc<dyn SessionHandler>>,
}

impl SessionIdManager {
    /// `worker_name` must not contain `.` (spec.md §7 Configuration error);
    /// `reseed_after == 0` disables periodic reseeding.
    pub fn new(worker_name: impl Into<String>, reseed_after: u64) -> Result<Self> {
        let worker_name = worker_name.into();
        if worker_name.contains('.') {
            return Err(Error::Configuration(format!(
                "workerName {worker_name:?} must not contain '.'"
            )));
        }

        Ok(Self {
            worker_name,
            rng: Mutex::new(seed_rng()),
            mint_count: AtomicU64::new(0),
            reseed_after,
            counter: AtomicU64::new(0),
            handlers: DashMap::new(),
        })
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    pub fn register_handler(&self, key: impl Into<String>, handler: Arc<dyn SessionHandler>) {
        self.handlers.insert(key.into(), handler);
    }

    pub fn unregister_handler(&self, key: &str) {
        self.handlers.remove(key);
    }

    /// True iff any registered context reports the id in use.
    pub async fn is_id_in_use(&self, id: &str) -> bool {
        for handler in self.handlers.iter() {
            if handler.value().is_id_in_use(id).await {
                return true;
            }
        }
        false
    }

    /// Reuse of a client-supplied id is only permitted when it is currently
    /// in use in at least one context; otherwise mint fresh. Never returns
    /// the empty string. The minting loop retries on collision, bounded
    /// only by the RNG's own properties (spec.md §4.8: "never" on failure
    /// to mint, no retry counter).
    #[tracing::instrument(skip(self))]
    pub async fn new_session_id(&self, requested_id: Option<&str>, _created_time: i64) -> String {
        if let Some(id) = requested_id {
            if !id.is_empty() && self.is_id_in_use(id).await {
                return id.to_string();
            }
        }

        loop {
            let candidate = self.mint_raw().await;
            if !candidate.is_empty() && !self.is_id_in_use(&candidate).await {
                return candidate;
            }
            tracing::warn!(candidate, "minted id collided with an in-use id, retrying");
        }
    }

    async fn mint_raw(&self) -> String {
        let (r1, r2) = {
            let mut rng = self.rng.lock().await;
            (rng.next_u64(), rng.next_u64())
        };

        let mint_count = self.mint_count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.reseed_after > 0 && mint_count % self.reseed_after == 0 {
            let mut rng = self.rng.lock().await;
            *rng = seed_rng();
            tracing::debug!(mint_count, "reseeded session id RNG");
        }

        let counter = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("{}{}{}{}", self.worker_name, to_base36(r1), to_base36(r2), counter)
    }

    /// Returns `id`, optionally suffixed with `.<workerName>` or a
    /// per-request `dynamic_suffix` (for downstream load-balancer
    /// affinity). `dynamic_suffix` wins when both are present.
    pub fn get_extended_id(&self, id: &str, dynamic_suffix: Option<&str>) -> String {
        let suffix = dynamic_suffix
            .filter(|s| !s.is_empty())
            .or_else(|| (!self.worker_name.is_empty()).then_some(self.worker_name.as_str()));

        match suffix {
            Some(suffix) => format!("{id}.{suffix}"),
            None => id.to_string(),
        }
    }

    /// Pure string function: the prefix before the final `.`, or the whole
    /// input if there is none.
    pub fn get_id(extended_id: &str) -> &str {
        match extended_id.rfind('.') {
            Some(idx) => &extended_id[..idx],
            None => extended_id,
        }
    }

    /// Fan out a local-invalidate notice to every registered handler.
    #[tracing::instrument(skip(self))]
    pub async fn invalidate_all(&self, id: &str) {
        for handler in self.handlers.iter() {
            handler.value().invalidate_locally(id).await;
        }
    }

    /// Alias kept for the spec's own naming (`expireAll`/`invalidateAll`
    /// name the same fan-out operation under two names across revisions).
    pub async fn expire_all(&self, id: &str) {
        self.invalidate_all(id).await;
    }

    /// Mint a fresh id and fan out a rename instruction to every context.
    #[tracing::instrument(skip(self))]
    pub async fn renew_session_id(&self, old_id: &str, created_time: i64) -> String {
        let new_id = self.new_session_id(None, created_time).await;
        for handler in self.handlers.iter() {
            if let Err(err) = handler.value().rename_locally(old_id, &new_id).await {
                tracing::error!(old_id, new_id, error = %err, "context failed to acknowledge rename");
            }
        }
        new_id
    }
}

fn seed_rng() -> ChaCha20Rng {
    let mut seed = [0u8; 32];
    match rand_core::OsRng.try_fill_bytes(&mut seed) {
        Ok(()) => ChaCha20Rng::from_seed(seed),
        Err(err) => {
            tracing::warn!(%err, "OS RNG unavailable, falling back to a weak RNG seed");
            ChaCha20Rng::from_seed(weak_seed())
        }
    }
}

/// A non-cryptographic fallback seed, used only when the OS RNG itself is
/// unavailable (spec.md §4.5: "falling back to a weak RNG on failure").
fn weak_seed() -> [u8; 32] {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::time::{SystemTime, UNIX_EPOCH};

    let mut hasher = DefaultHasher::new();
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    std::process::id().hash(&mut hasher);

    let digest = hasher.finish();
    let mut seed = [0u8; 32];
    seed[..8].copy_from_slice(&digest.to_le_bytes());
    seed
}

const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn to_base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(BASE36_ALPHABET[(n % 36) as usize]);
        n /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).expect("base36 alphabet is ASCII")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct FakeHandler {
        in_use: StdMutex<std::collections::HashSet<String>>,
    }

    #[async_trait]
    impl SessionHandler for FakeHandler {
        async fn is_id_in_use(&self, id: &str) -> bool {
            self.in_use.lock().unwrap().contains(id)
        }
        async fn invalidate_locally(&self, id: &str) {
            self.in_use.lock().unwrap().remove(id);
        }
        async fn rename_locally(&self, old_id: &str, new_id: &str) -> Result<()> {
            let mut set = self.in_use.lock().unwrap();
            if set.remove(old_id) {
                set.insert(new_id.to_string());
            }
            Ok(())
        }
    }

    #[test]
    fn rejects_worker_name_with_dot() {
        assert!(SessionIdManager::new("node.1", 0).is_err());
    }

    #[tokio::test]
    async fn minted_ids_are_never_empty_and_contain_no_dot_without_worker_name() {
        let manager = SessionIdManager::new("", 0).unwrap();
        for _ in 0..20 {
            let id = manager.new_session_id(None, 0).await;
            assert!(!id.is_empty());
            assert!(!id.contains('.'));
        }
    }

    #[tokio::test]
    async fn reuses_requested_id_only_when_in_use() {
        let manager = SessionIdManager::new("", 0).unwrap();
        let mut in_use = std::collections::HashSet::new();
        in_use.insert("client-id".to_string());
        manager.register_handler("ctx", Arc::new(FakeHandler { in_use: StdMutex::new(in_use) }));

        let reused = manager.new_session_id(Some("client-id"), 0).await;
        assert_eq!(reused, "client-id");

        let fresh = manager.new_session_id(Some("unknown-id"), 0).await;
        assert_ne!(fresh, "unknown-id");
    }

    #[test]
    fn get_id_strips_trailing_suffix_only() {
        assert_eq!(SessionIdManager::get_id("abc.worker1"), "abc");
        assert_eq!(SessionIdManager::get_id("abc"), "abc");
        assert_eq!(SessionIdManager::get_id("a.b.c"), "a.b");
    }

    #[tokio::test]
    async fn extended_id_prefers_dynamic_suffix_over_worker_name() {
        let manager = SessionIdManager::new("worker1", 0).unwrap();
        assert_eq!(manager.get_extended_id("abc", None), "abc.worker1");
        assert_eq!(manager.get_extended_id("abc", Some("lb-2")), "abc.lb-2");
    }

    #[tokio::test]
    async fn renew_session_id_fans_out_to_handlers() {
        let manager = SessionIdManager::new("", 0).unwrap();
        let mut in_use = std::collections::HashSet::new();
        in_use.insert("old".to_string());
        let handler = Arc::new(FakeHandler { in_use: StdMutex::new(in_use) });
        manager.register_handler("ctx", handler.clone());

        let new_id = manager.renew_session_id("old", 0).await;
        assert!(!handler.is_id_in_use("old").await);
        assert!(handler.is_id_in_use(&new_id).await);
    }
}
