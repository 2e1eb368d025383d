//! Shared table/column names and SQL text builders (spec.md §6's schema).

use super::adapter::DbAdapter;

pub const TABLE: &str = "jetty_sessions";
pub const ID_REGISTRY_TABLE: &str = "jetty_session_ids";

pub const COLUMNS: &[&str] = &[
    "id",
    "context_path",
    "vhost",
    "last_node",
    "access_time",
    "last_access_time",
    "create_time",
    "cookie_time",
    "last_saved_time",
    "expiry_time",
    "max_interval",
    "map",
];

/// `CREATE TABLE IF NOT EXISTS` for the sessions table (spec.md §6).
pub fn create_table_sql(adapter: &dyn DbAdapter) -> String {
    let q = |ident: &str| adapter.quote_identifier(ident);
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\
            {id} TEXT NOT NULL, \
            {ctx} TEXT, \
            {vhost} TEXT, \
            {node} TEXT, \
            {accessed} {long}, \
            {last_accessed} {long}, \
            {created} {long}, \
            {cookie} {long}, \
            {saved} {long}, \
            {expiry} {long}, \
            {max_interval} {long}, \
            {map} {blob}, \
            PRIMARY KEY ({id}, {ctx}, {vhost}))",
        table = TABLE,
        id = q("id"),
        ctx = q("context_path"),
        vhost = q("vhost"),
        node = q("last_node"),
        accessed = q("access_time"),
        last_accessed = q("last_access_time"),
        created = q("create_time"),
        cookie = q("cookie_time"),
        saved = q("last_saved_time"),
        expiry = q("expiry_time"),
        max_interval = q("max_interval"),
        map = q("map"),
        long = adapter.long_type(),
        blob = adapter.blob_type(),
    )
}

pub fn create_expiry_index_sql(adapter: &dyn DbAdapter) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS idx_jetty_sessions_expiry ON {table} ({col})",
        table = TABLE,
        col = adapter.quote_identifier("expiry_time"),
    )
}

pub fn create_id_context_index_sql(adapter: &dyn DbAdapter) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS idx_jetty_sessions_id_context ON {table} ({id}, {ctx})",
        table = TABLE,
        id = adapter.quote_identifier("id"),
        ctx = adapter.quote_identifier("context_path"),
    )
}

pub fn add_max_interval_column_sql(adapter: &dyn DbAdapter) -> String {
    format!(
        "ALTER TABLE {table} ADD COLUMN {col} {long}",
        table = TABLE,
        col = adapter.quote_identifier("max_interval"),
        long = adapter.long_type(),
    )
}

pub fn create_id_registry_table_sql(adapter: &dyn DbAdapter) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} ({id} TEXT PRIMARY KEY)",
        table = ID_REGISTRY_TABLE,
        id = adapter.quote_identifier("id"),
    )
}
