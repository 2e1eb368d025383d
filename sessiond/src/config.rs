//! Plain `serde`-deserializable configuration, in the style of the
//! teacher's `config.rs::ServerConfig`/`TlsOptions` — no thread-local
//! globals, no hidden statics (spec.md §6 "Configuration options").

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessiondConfig {
    /// Server-wide worker/node name (spec.md §6 `workerName`). Must not
    /// contain `.`; empty means no `.worker` suffix on extended ids.
    pub worker_name: String,
    pub context_path: String,
    pub vhost: String,
    /// `maxInactiveIntervalSec`; `<= 0` means immortal.
    pub max_inactive_sec: i64,
    pub eviction_policy: EvictionPolicyConfig,
    /// `stalePeriodSec`; `<= 0` disables staleness checking.
    pub stale_period_sec: i64,
    /// `reseed`: mints between RNG reseeds; `0` disables periodic reseed.
    pub reseed: u64,
    pub node_id_in_session_id: bool,
    /// How often the HouseKeeper tick runs.
    pub scavenge_interval_sec: u64,
    pub store: StoreConfig,
}

impl Default for SessiondConfig {
    fn default() -> Self {
        Self {
            worker_name: String::new(),
            context_path: "/".to_string(),
            vhost: "default".to_string(),
            max_inactive_sec: 1_800,
            eviction_policy: EvictionPolicyConfig::Never,
            stale_period_sec: 0,
            reseed: 10_000,
            node_id_in_session_id: false,
            scavenge_interval_sec: 60,
            store: StoreConfig::Memory,
        }
    }
}

impl SessiondConfig {
    /// Load overrides from environment variables, matching the teacher's
    /// own `dotenv::var` bootstrap in `main.rs`. A `SESSIOND_CONFIG`
    /// variable holding a JSON object overrides the whole struct in one
    /// shot; individual `SESSIOND_*` variables override one field each on
    /// top of that.
    pub fn from_env() -> Self {
        let mut config = dotenv::var("SESSIOND_CONFIG")
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();

        if let Ok(worker_name) = dotenv::var("SESSIOND_WORKER_NAME") {
            config.worker_name = worker_name;
        }
        if let Ok(context_path) = dotenv::var("SESSIOND_CONTEXT_PATH") {
            config.context_path = context_path;
        }
        if let Ok(vhost) = dotenv::var("SESSIOND_VHOST") {
            config.vhost = vhost;
        }
        if let Some(max_inactive_sec) = dotenv::var("SESSIOND_MAX_INACTIVE_SEC").ok().and_then(|v| v.parse().ok()) {
            config.max_inactive_sec = max_inactive_sec;
        }

        config
    }
}

/// Mirrors `session_cache::EvictionPolicy`, kept as its own
/// `Deserialize`-able type so the cache crate's enum doesn't have to carry
/// a `serde` dependency just for config loading.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EvictionPolicyConfig {
    Never,
    OnSessionExit,
    OnInactivity { idle_timeout_sec: u64 },
}

impl From<EvictionPolicyConfig> for session_cache::EvictionPolicy {
    fn from(config: EvictionPolicyConfig) -> Self {
        match config {
            EvictionPolicyConfig::Never => Self::Never,
            EvictionPolicyConfig::OnSessionExit => Self::OnSessionExit,
            EvictionPolicyConfig::OnInactivity { idle_timeout_sec } => Self::OnInactivity(idle_timeout_sec),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StoreConfig {
    Memory,
    File { base_dir: PathBuf },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_immortal_free_and_in_process() {
        let config = SessiondConfig::default();
        assert_eq!(config.worker_name, "");
        assert!(matches!(config.store, StoreConfig::Memory));
    }
}
