//! SQLite `SessionDataStore` (spec.md §4.2/§6).
//!
//! Grounded on the PRAGMA-based column introspection pattern from
//! `actix-extras::actix-session::storage::sqlite`.

use std::collections::HashSet;

use async_trait::async_trait;
use session_core::{Error, Result, SessionContext, SessionData};
use sqlx::{Row, SqlitePool};

use super::adapter::{from_storage, DbAdapter, SqliteAdapter};
use super::schema;

struct BoundContext {
    worker_name: String,
    context_path: String,
    vhost: String,
}

pub struct SqliteStore {
    pool: SqlitePool,
    adapter: SqliteAdapter,
    context: tokio::sync::OnceCell<BoundContext>,
    grace_period_ms: i64,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, grace_period_ms: i64) -> Self {
        Self {
            pool,
            adapter: SqliteAdapter,
            context: tokio::sync::OnceCell::new(),
            grace_period_ms,
        }
    }

    fn ctx(&self) -> Result<&BoundContext> {
        self.context.get().ok_or(Error::Lifecycle)
    }

    async fn ensure_max_interval_column(&self) -> Result<()> {
        let rows = sqlx::query(&format!("PRAGMA table_info({table})", table = schema::TABLE))
            .fetch_all(&self.pool)
            .await
            .map_err(Error::transient)?;

        let has_column = rows.iter().any(|row| {
            row.try_get::<String, _>("name")
                .map(|name| name == "max_interval")
                .unwrap_or(false)
        });

        if !has_column {
            sqlx::query(&schema::add_max_interval_column_sql(&self.adapter))
                .execute(&self.pool)
                .await
                .map_err(Error::transient)?;
        }
        Ok(())
    }
}

#[async_trait]
impl crate::SessionDataStore for SqliteStore {
    #[tracing::instrument(skip(self, context), err)]
    async fn initialize(&self, context: &SessionContext) -> Result<()> {
        sqlx::query(&schema::create_table_sql(&self.adapter))
            .execute(&self.pool)
            .await
            .map_err(Error::transient)?;
        self.ensure_max_interval_column().await?;
        sqlx::query(&schema::create_expiry_index_sql(&self.adapter))
            .execute(&self.pool)
            .await
            .map_err(Error::transient)?;
        sqlx::query(&schema::create_id_context_index_sql(&self.adapter))
            .execute(&self.pool)
            .await
            .map_err(Error::transient)?;
        sqlx::query(&schema::create_id_registry_table_sql(&self.adapter))
            .execute(&self.pool)
            .await
            .map_err(Error::transient)?;

        self.context
            .set(BoundContext {
                worker_name: context.worker_name.clone(),
                context_path: context.canonical_context_path.clone(),
                vhost: context.vhost.clone(),
            })
            .map_err(|_| Error::Lifecycle)?;
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    async fn load(&self, id: &str) -> Result<Option<SessionData>> {
        let ctx = self.ctx()?;
        let row = sqlx::query(&format!(
            "SELECT id, context_path, vhost, last_node, access_time, last_access_time, \
             create_time, cookie_time, last_saved_time, expiry_time, max_interval, map \
             FROM {table} WHERE id = ? AND context_path IS ? AND vhost IS ?",
            table = schema::TABLE
        ))
        .bind(id)
        .bind(&ctx.context_path)
        .bind(&ctx.vhost)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::transient)?;

        row.map(|row| row_to_session_data(&row)).transpose()
    }

    #[tracing::instrument(skip(self, data), err)]
    async fn store(&self, id: &str, data: &mut SessionData, last_save_time: i64, now: i64) -> Result<()> {
        let ctx = self.ctx()?;
        let map = session_core::serialize_attributes(&data.attributes);

        if last_save_time <= 0 {
            sqlx::query(&format!(
                "INSERT INTO {table} \
                 (id, context_path, vhost, last_node, access_time, last_access_time, \
                  create_time, cookie_time, last_saved_time, expiry_time, max_interval, map) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                table = schema::TABLE
            ))
            .bind(id)
            .bind(&ctx.context_path)
            .bind(&ctx.vhost)
            .bind(&data.last_node)
            .bind(data.accessed)
            .bind(data.last_accessed)
            .bind(data.created)
            .bind(data.cookie_set)
            .bind(now)
            .bind(data.expiry)
            .bind(data.max_inactive_ms)
            .bind(&map)
            .execute(&self.pool)
            .await
            .map_err(Error::transient)?;
        } else {
            sqlx::query(&format!(
                "UPDATE {table} SET last_node = ?, access_time = ?, last_access_time = ?, \
                 cookie_time = ?, last_saved_time = ?, expiry_time = ?, max_interval = ?, map = ? \
                 WHERE id = ? AND context_path IS ? AND vhost IS ?",
                table = schema::TABLE
            ))
            .bind(&data.last_node)
            .bind(data.accessed)
            .bind(data.last_accessed)
            .bind(data.cookie_set)
            .bind(now)
            .bind(data.expiry)
            .bind(data.max_inactive_ms)
            .bind(&map)
            .bind(id)
            .bind(&ctx.context_path)
            .bind(&ctx.vhost)
            .execute(&self.pool)
            .await
            .map_err(Error::transient)?;
        }

        data.mark_saved(now);
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    async fn delete(&self, id: &str) -> Result<bool> {
        let ctx = self.ctx()?;
        let result = sqlx::query(&format!(
            "DELETE FROM {table} WHERE id = ? AND context_path IS ? AND vhost IS ?",
            table = schema::TABLE
        ))
        .bind(id)
        .bind(&ctx.context_path)
        .bind(&ctx.vhost)
        .execute(&self.pool)
        .await
        .map_err(Error::transient)?;

        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self), err)]
    async fn exists(&self, id: &str, now: i64) -> Result<bool> {
        let ctx = self.ctx()?;
        let row: Option<(i64,)> = sqlx::query_as(&format!(
            "SELECT expiry_time FROM {table} WHERE id = ? AND context_path IS ? AND vhost IS ?",
            table = schema::TABLE
        ))
        .bind(id)
        .bind(&ctx.context_path)
        .bind(&ctx.vhost)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::transient)?;

        Ok(row.map(|(expiry,)| expiry == 0 || expiry > now).unwrap_or(false))
    }

    #[tracing::instrument(skip(self, candidates), err)]
    async fn get_expired(&self, candidates: &HashSet<String>, now: i64) -> Result<HashSet<String>> {
        let mut expired = HashSet::new();
        expired.extend(self.expired_in_own_context(now).await?);
        expired.extend(self.expired_past_grace_period(now).await?);
        expired.extend(self.expired_by_absence(candidates).await?);
        Ok(expired)
    }

    fn is_passivating(&self) -> bool {
        true
    }
}

impl SqliteStore {
    /// Pass 1: rows owned by this node, in this context, expired before now.
    async fn expired_in_own_context(&self, now: i64) -> Result<HashSet<String>> {
        let ctx = self.ctx()?;
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            "SELECT id FROM {table} WHERE context_path IS ? AND vhost IS ? AND last_node = ? \
             AND expiry_time > 0 AND expiry_time <= ?",
            table = schema::TABLE
        ))
        .bind(&ctx.context_path)
        .bind(&ctx.vhost)
        .bind(&ctx.worker_name)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::transient)?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Pass 2: rows belonging to any node, expired more than one grace
    /// period ago (catches sessions orphaned by a dead node).
    async fn expired_past_grace_period(&self, now: i64) -> Result<HashSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            "SELECT id FROM {table} WHERE expiry_time > 0 AND expiry_time <= ?",
            table = schema::TABLE
        ))
        .bind(now - self.grace_period_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::transient)?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Pass 3: caller-supplied candidates with no row at all -> expired by
    /// absence.
    async fn expired_by_absence(&self, candidates: &HashSet<String>) -> Result<HashSet<String>> {
        let mut expired = HashSet::new();
        for candidate in candidates {
            let found: Option<(i64,)> = sqlx::query_as(&format!(
                "SELECT 1 FROM {table} WHERE id = ? LIMIT 1",
                table = schema::TABLE
            ))
            .bind(candidate)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::transient)?;

            if found.is_none() {
                expired.insert(candidate.clone());
            }
        }
        Ok(expired)
    }
}

fn row_to_session_data(row: &sqlx::sqlite::SqliteRow) -> Result<SessionData> {
    let context_path: Option<String> = row.try_get("context_path").map_err(Error::transient)?;
    let vhost: Option<String> = row.try_get("vhost").map_err(Error::transient)?;
    let map: Vec<u8> = row.try_get("map").map_err(Error::transient)?;
    let attributes = session_core::deserialize_attributes(&map)?;

    Ok(SessionData {
        id: row.try_get("id").map_err(Error::transient)?,
        context_path: from_storage(context_path),
        vhost: from_storage(vhost),
        last_node: row.try_get("last_node").map_err(Error::transient)?,
        created: row.try_get("create_time").map_err(Error::transient)?,
        accessed: row.try_get("access_time").map_err(Error::transient)?,
        last_accessed: row.try_get("last_access_time").map_err(Error::transient)?,
        cookie_set: row.try_get("cookie_time").map_err(Error::transient)?,
        last_saved: row.try_get("last_saved_time").map_err(Error::transient)?,
        expiry: row.try_get("expiry_time").map_err(Error::transient)?,
        max_inactive_ms: row.try_get("max_interval").map_err(Error::transient)?,
        attributes,
        dirty: false,
        meta_data_dirty: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionDataStore;

    async fn pool() -> SqlitePool {
        SqlitePool::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn create_table_then_store_and_load_round_trips() {
        let store = SqliteStore::new(pool().await, 30_000);
        let ctx = SessionContext::new("node-a", "/app", "host-a");
        store.initialize(&ctx).await.unwrap();

        let mut data = SessionData::new("s1", "_app", "host-a", 0, 60_000);
        data.set_attribute("k", serde_json::json!("v"));
        store.store("s1", &mut data, 0, 10).await.unwrap();

        let loaded = store.load("s1").await.unwrap().unwrap();
        assert_eq!(loaded.get_attribute("k").unwrap(), &serde_json::json!("v"));
        assert_eq!(loaded.last_saved, 10);
    }

    #[tokio::test]
    async fn empty_context_path_round_trips_on_sqlite() {
        let store = SqliteStore::new(pool().await, 30_000);
        let ctx = SessionContext::new("", "", "");
        store.initialize(&ctx).await.unwrap();

        let mut data = SessionData::new("s1", "", "", 0, 0);
        store.store("s1", &mut data, 0, 0).await.unwrap();

        let loaded = store.load("s1").await.unwrap().unwrap();
        assert_eq!(loaded.context_path, "");
        assert_eq!(loaded.vhost, "");
    }

    #[tokio::test]
    async fn migrates_legacy_table_missing_max_interval() {
        let pool = pool().await;
        sqlx::query(
            "CREATE TABLE jetty_sessions (id TEXT, context_path TEXT, vhost TEXT, last_node TEXT, \
             access_time INTEGER, last_access_time INTEGER, create_time INTEGER, cookie_time INTEGER, \
             last_saved_time INTEGER, expiry_time INTEGER, map BLOB, PRIMARY KEY (id, context_path, vhost))",
        )
        .execute(&pool)
        .await
        .unwrap();

        let store = SqliteStore::new(pool, 30_000);
        let ctx = SessionContext::new("", "/app", "host-a");
        store.initialize(&ctx).await.unwrap();

        let mut data = SessionData::new("s1", "_app", "host-a", 0, 60_000);
        store.store("s1", &mut data, 0, 0).await.unwrap();
        assert!(store.load("s1").await.unwrap().is_some());
    }
}
