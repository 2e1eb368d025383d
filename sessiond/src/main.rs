//! Process wiring for the distributed session subsystem (spec.md §6
//! lifecycle). Demonstrates the full start order — DataStore -> Cache ->
//! Manager -> IdManager -> HouseKeeper — end to end with a single context,
//! for manual inspection; HTTP serving itself is a non-goal of this crate.
//!
//! Bootstrap idiom (tracing-subscriber `fmt` + `EnvFilter`, `dotenv`) is
//! grounded on the teacher's own `main.rs`, kept as ambient stack per
//! `SPEC_FULL.md` §5 even though HTTP serving itself is out of scope here.

mod config;

use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::json;
use session_cache::{DefaultSessionCache, SessionCache, StalenessPolicy};
use session_core::{ListenerEvent, ListenerHandle, SessionContext, SessionListener};
use session_housekeeper::HouseKeeper;
use session_id::SessionIdManager;
use session_manager::{ServerLifecycle, SessionManager, SessionManagerConfig};
use session_store::file::FileStore;
use session_store::memory::MemoryStore;
use session_store::SessionDataStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::{SessiondConfig, StoreConfig};

/// Logs every listener event at `info`/`debug`, standing in for the
/// framework-specific dispatch the spec leaves to the caller (spec.md §1
/// "the core exposes hooks for listener callbacks; how they are dispatched
/// is the caller's concern").
struct TracingListener;

#[async_trait]
impl SessionListener for TracingListener {
    async fn on_event(&self, event: &ListenerEvent) {
        match event {
            ListenerEvent::SessionCreated { key } => tracing::info!(%key, "session created"),
            ListenerEvent::SessionDestroyed { key } => tracing::info!(%key, "session destroyed"),
            ListenerEvent::IdChanged { old_id, new_key } => {
                tracing::info!(old_id, %new_key, "session id changed")
            }
            ListenerEvent::AttributeAdded { key, name, .. } => tracing::debug!(%key, name, "attribute added"),
            ListenerEvent::AttributeReplaced { key, name, .. } => {
                tracing::debug!(%key, name, "attribute replaced")
            }
            ListenerEvent::AttributeRemoved { key, name, .. } => {
                tracing::debug!(%key, name, "attribute removed")
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(
            #[cfg(debug_assertions)]
            |_| "trace,sqlx=info".into(),
            #[cfg(not(debug_assertions))]
            |_| "info,sqlx=info".into(),
        )))
        .with(
            #[cfg(debug_assertions)]
            tracing_subscriber::fmt::layer().pretty().with_file(true).with_line_number(true),
            #[cfg(not(debug_assertions))]
            tracing_subscriber::fmt::layer().compact(),
        )
        .try_init()?;

    let config = SessiondConfig::from_env();
    let (lifecycle, manager) = wire_up(&config).await?;

    lifecycle.start().await?;
    run_demo_request(&manager).await?;
    lifecycle.stop().await?;

    Ok(())
}

async fn wire_up(config: &SessiondConfig) -> Result<(ServerLifecycle, Arc<SessionManager>), Box<dyn Error>> {
    let store: Arc<dyn SessionDataStore> = match &config.store {
        StoreConfig::Memory => Arc::new(MemoryStore::new()),
        StoreConfig::File { base_dir } => {
            if !tokio::fs::try_exists(base_dir).await? {
                tokio::fs::create_dir_all(base_dir).await?;
            }
            Arc::new(FileStore::new(base_dir.clone()))
        }
    };

    let listeners = ListenerHandle::new();
    listeners.register(Arc::new(TracingListener)).await;

    let context = SessionContext::new(config.worker_name.clone(), &config.context_path, config.vhost.clone());
    let handler_key = format!("{}@{}", context.canonical_context_path, context.vhost);

    let cache: Arc<dyn SessionCache> = Arc::new(DefaultSessionCache::new(
        store.clone(),
        listeners.clone(),
        context.clone(),
        config.eviction_policy.into(),
        StalenessPolicy::new(config.stale_period_sec.max(0) * 1_000),
    ));

    let id_manager = Arc::new(SessionIdManager::new(config.worker_name.clone(), config.reseed)?);

    let manager = Arc::new(SessionManager::new(
        context,
        store,
        cache.clone(),
        id_manager.clone(),
        listeners,
        SessionManagerConfig {
            max_inactive_sec: config.max_inactive_sec,
            node_id_in_session_id: config.node_id_in_session_id,
        },
    ));

    let housekeeper = Arc::new(HouseKeeper::new(id_manager, Duration::from_secs(config.scavenge_interval_sec)));
    housekeeper.register_context(handler_key, cache).await;

    Ok((ServerLifecycle::new(vec![manager.clone()], housekeeper), manager))
}

/// Exercises create -> access -> attribute mutation -> invalidate against
/// the freshly started subsystem, purely for manual inspection of the
/// logged listener events. Request dispatch itself (routing an inbound
/// HTTP request to this call) is the caller's concern, per spec.md §1.
async fn run_demo_request(manager: &Arc<SessionManager>) -> Result<(), Box<dyn Error>> {
    let now = now_ms();

    let session = manager.create_or_get(None, now).await?;
    let id = session.snapshot().await?.id;
    tracing::info!(id, extended_id = %manager.extended_id(&id, None), "demo session created");

    manager.set_attribute(&id, &session, "visits", demo_attribute()).await?;
    manager.complete_request(&id, &session, now).await?;

    let fetched = manager.get(&id, now + 1).await?;
    tracing::info!(found = fetched.is_some(), "demo session re-fetched after request exit");

    manager.invalidate(&id).await?;
    Ok(())
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

fn demo_attribute() -> serde_json::Value {
    json!({ "visits": 1 })
}
