//! Relational `SessionDataStore` (spec.md §4.2/§6/§9).
//!
//! `DbAdapter` encapsulates the dialect differences spec.md §9 calls out
//! (long/blob column types, identifier case folding, empty-string-vs-NULL
//! handling); each dialect is its own concrete `SessionDataStore`
//! implementation rather than one generic store, per spec.md §9's explicit
//! "each dialect is a separate implementation."
//!
//! Grounded on the table/TTL modeling in
//! `reinhardt-auth::sessions::backends::database` and on the teacher's own
//! `sqlx` dependency (`postgres`, `runtime-tokio-rustls`, `time` features),
//! generalized with `mysql`/`sqlite` features per `SPEC_FULL.md` §6.

mod adapter;
mod mysql;
mod postgres;
mod schema;
mod sqlite;

pub use adapter::{DbAdapter, MySqlAdapter, PostgresAdapter, SqliteAdapter};
pub use mysql::MySqlStore;
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

/// Grace period (spec.md §6 `gracePeriodSec`), expressed in ms, applied by
/// the any-node/any-context expiry pass.
#[derive(Debug, Clone, Copy)]
pub struct GracePeriod(pub i64);
