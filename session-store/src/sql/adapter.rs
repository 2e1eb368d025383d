//! `DbAdapter`: the dialect-differences trait (spec.md §4.2/§9).

/// Encapsulates the handful of ways SQL dialects disagree that this store
/// needs to know about: column types for 64-bit integers and binary blobs,
/// identifier case folding / quoting, and whether empty strings round-trip
/// as empty strings or must be coerced to `NULL`.
pub trait DbAdapter: Send + Sync + std::fmt::Debug {
    fn long_type(&self) -> &'static str;
    fn blob_type(&self) -> &'static str;

    /// Quote an identifier per this dialect's rules (reserved-word safety).
    fn quote_identifier(&self, ident: &str) -> String;

    /// Whether this dialect's adapter coerces an empty `context_path`/`vhost`
    /// to SQL `NULL` on write (and back to `""` on read).
    ///
    /// Postgres and MySQL both commonly treat `''` and `NULL`
    /// inconsistently across unique-index semantics — Postgres's unique
    /// index does *not* treat two `NULL`s as equal the way it treats two
    /// `''`s as equal, so real Jetty-lineage adapters special-case this
    /// rather than relying on the database. SQLite's TEXT affinity accepts
    /// empty strings natively, so no coercion is needed there.
    fn coerce_empty_to_null(&self) -> bool;
}

/// Coerce `s` to `None` (meaning: bind SQL `NULL`) when this adapter
/// requires it and `s` is empty; otherwise pass it through unchanged.
pub fn to_storage<'a>(adapter: &dyn DbAdapter, s: &'a str) -> Option<&'a str> {
    if s.is_empty() && adapter.coerce_empty_to_null() {
        None
    } else {
        Some(s)
    }
}

/// Inverse of [`to_storage`]: a `NULL` read back from a coercing dialect is
/// the empty string again.
pub fn from_storage(value: Option<String>) -> String {
    value.unwrap_or_default()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresAdapter;

impl DbAdapter for PostgresAdapter {
    fn long_type(&self) -> &'static str {
        "BIGINT"
    }

    fn blob_type(&self) -> &'static str {
        "BYTEA"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{ident}\"")
    }

    fn coerce_empty_to_null(&self) -> bool {
        true
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlAdapter;

impl DbAdapter for MySqlAdapter {
    fn long_type(&self) -> &'static str {
        "BIGINT"
    }

    fn blob_type(&self) -> &'static str {
        "BLOB"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("`{ident}`")
    }

    fn coerce_empty_to_null(&self) -> bool {
        true
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteAdapter;

impl DbAdapter for SqliteAdapter {
    fn long_type(&self) -> &'static str {
        "INTEGER"
    }

    fn blob_type(&self) -> &'static str {
        "BLOB"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{ident}\"")
    }

    fn coerce_empty_to_null(&self) -> bool {
        false
    }
}
