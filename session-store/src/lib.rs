//! Pluggable session persistence (spec.md §4.2).
//!
//! Defines the [`SessionDataStore`] trait and three concrete
//! implementations: an in-process map ([`memory::MemoryStore`]), a
//! filesystem store ([`file::FileStore`]), and a relational store
//! ([`sql::SqlStore`]) generalized across Postgres/MySQL/SQLite via the
//! [`sql::DbAdapter`] trait.
//!
//! Grounded directly on the upstream `SessionStore` trait
//! (`tower-sessions-core::session_store`), generalized from cookie-session
//! CRUD to the spec's `load/store/delete/exists/getExpired/isPassivating`
//! surface.

pub mod file;
pub mod memory;
pub mod sql;

use std::collections::HashSet;

use async_trait::async_trait;
use session_core::{SessionContext, SessionData};

pub use session_core::{Error, Result};

/// Pluggable backing store for `SessionData` (spec.md §4.2).
#[async_trait]
pub trait SessionDataStore: std::fmt::Debug + Send + Sync + 'static {
    /// Bind to a context carrying `workerName`/`canonicalContextPath`/
    /// `vhost`. Must be called once, before `start`. Implementations that
    /// need to create tables/directories do so here.
    async fn initialize(&self, context: &SessionContext) -> Result<()>;

    /// Returns the current durable record, or `None` iff absent.
    async fn load(&self, id: &str) -> Result<Option<SessionData>>;

    /// Insert when `last_save_time <= 0`, otherwise update. On success,
    /// stamps `data.last_saved := now` and clears dirty flags.
    async fn store(&self, id: &str, data: &mut SessionData, last_save_time: i64, now: i64) -> Result<()>;

    /// Returns `true` iff a row was removed.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Returns `true` iff a non-expired record exists.
    async fn exists(&self, id: &str, now: i64) -> Result<bool>;

    /// Given a set of ids the caller believes expired, return the set of
    /// ids that are, per the store, actually expired or unknown.
    /// Implementations must also contribute ids the caller did not know
    /// about (orphans) when they can cheaply do so.
    async fn get_expired(&self, candidates: &HashSet<String>, now: i64) -> Result<HashSet<String>>;

    /// Whether this store requires attribute (de)serialization, i.e.
    /// crosses a process boundary.
    fn is_passivating(&self) -> bool;
}
