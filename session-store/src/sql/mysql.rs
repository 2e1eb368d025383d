//! MySQL `SessionDataStore` (spec.md §4.2/§6).

use std::collections::HashSet;

use async_trait::async_trait;
use session_core::{Error, Result, SessionContext, SessionData};
use sqlx::{MySqlPool, Row};

use super::adapter::{from_storage, to_storage, DbAdapter, MySqlAdapter};
use super::schema;

struct BoundContext {
    worker_name: String,
    context_path_storage: Option<String>,
    vhost_storage: Option<String>,
}

pub struct MySqlStore {
    pool: MySqlPool,
    adapter: MySqlAdapter,
    context: tokio::sync::OnceCell<BoundContext>,
    grace_period_ms: i64,
}

impl std::fmt::Debug for MySqlStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlStore").finish_non_exhaustive()
    }
}

impl MySqlStore {
    pub fn new(pool: MySqlPool, grace_period_ms: i64) -> Self {
        Self {
            pool,
            adapter: MySqlAdapter,
            context: tokio::sync::OnceCell::new(),
            grace_period_ms,
        }
    }

    fn ctx(&self) -> Result<&BoundContext> {
        self.context.get().ok_or(Error::Lifecycle)
    }

    async fn ensure_max_interval_column(&self) -> Result<()> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT COUNT(*) FROM information_schema.columns \
             WHERE table_schema = DATABASE() AND table_name = ? AND column_name = ?",
        )
        .bind(schema::TABLE)
        .bind("max_interval")
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::transient)?;

        if row.map(|(count,)| count == 0).unwrap_or(true) {
            sqlx::query(&schema::add_max_interval_column_sql(&self.adapter))
                .execute(&self.pool)
                .await
                .map_err(Error::transient)?;
        }
        Ok(())
    }
}

#[async_trait]
impl crate::SessionDataStore for MySqlStore {
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
            .ok(); // MySQL has no "IF NOT EXISTS" for indexes pre-8.0.29; ignore duplicate-index errors.
        sqlx::query(&schema::create_id_context_index_sql(&self.adapter))
            .execute(&self.pool)
            .await
            .ok();
        sqlx::query(&schema::create_id_registry_table_sql(&self.adapter))
            .execute(&self.pool)
            .await
            .map_err(Error::transient)?;

        let bound = BoundContext {
            worker_name: context.worker_name.clone(),
            context_path_storage: to_storage(&self.adapter, &context.canonical_context_path)
                .map(str::to_string),
            vhost_storage: to_storage(&self.adapter, &context.vhost).map(str::to_string),
        };
        self.context.set(bound).map_err(|_| Error::Lifecycle)?;
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    async fn load(&self, id: &str) -> Result<Option<SessionData>> {
        let ctx = self.ctx()?;
        let row = sqlx::query(&format!(
            "SELECT id, context_path, vhost, last_node, access_time, last_access_time, \
             create_time, cookie_time, last_saved_time, expiry_time, max_interval, map \
             FROM {table} WHERE id = ? AND context_path <=> ? AND vhost <=> ?",
            table = schema::TABLE
        ))
        .bind(id)
        .bind(&ctx.context_path_storage)
        .bind(&ctx.vhost_storage)
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
            .bind(&ctx.context_path_storage)
            .bind(&ctx.vhost_storage)
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
                 WHERE id = ? AND context_path <=> ? AND vhost <=> ?",
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
            .bind(&ctx.context_path_storage)
            .bind(&ctx.vhost_storage)
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
            "DELETE FROM {table} WHERE id = ? AND context_path <=> ? AND vhost <=> ?",
            table = schema::TABLE
        ))
        .bind(id)
        .bind(&ctx.context_path_storage)
        .bind(&ctx.vhost_storage)
        .execute(&self.pool)
        .await
        .map_err(Error::transient)?;

        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self), err)]
    async fn exists(&self, id: &str, now: i64) -> Result<bool> {
        let ctx = self.ctx()?;
        let row: Option<(i64,)> = sqlx::query_as(&format!(
            "SELECT expiry_time FROM {table} WHERE id = ? AND context_path <=> ? AND vhost <=> ?",
            table = schema::TABLE
        ))
        .bind(id)
        .bind(&ctx.context_path_storage)
        .bind(&ctx.vhost_storage)
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

impl MySqlStore {
    /// Pass 1: rows owned by this node, in this context, expired before now.
    async fn expired_in_own_context(&self, now: i64) -> Result<HashSet<String>> {
        let ctx = self.ctx()?;
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            "SELECT id FROM {table} WHERE context_path <=> ? AND vhost <=> ? AND last_node = ? \
             AND expiry_time > 0 AND expiry_time <= ?",
            table = schema::TABLE
        ))
        .bind(&ctx.context_path_storage)
        .bind(&ctx.vhost_storage)
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

fn row_to_session_data(row: &sqlx::mysql::MySqlRow) -> Result<SessionData> {
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
