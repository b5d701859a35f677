use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use mediaflow_model::{OwnerId, ProgressEvent, TaskId, TaskStatus};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use tracing::info;

use super::{EventLog, OrchestratorStore, QuotaStore, TaskStore};
use crate::error::{ConsistencyError, OrchestratorError, Result};
use crate::orchestration::quota::QuotaEntry;
use crate::orchestration::task::TaskRecord;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const TERMINAL_STATUSES: &str = "('completed', 'failed', 'rejected')";

/// SQLite-backed store. Task snapshots and events are kept as JSON documents
/// next to the indexed columns the queries filter on.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(value: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(value)
        .single()
        .ok_or_else(|| OrchestratorError::Storage(format!("invalid timestamp {value}")))
}

impl SqliteStore {
    /// Connects, creating the database file if needed, and runs migrations.
    ///
    /// In-memory URLs get a single long-lived connection so every query sees
    /// the same database.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };

        let pool = pool_options.connect_with(options).await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        MIGRATOR.run(&pool).await?;
        info!(target: "mediaflow::store", "sqlite store ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn decode_task(document: &str) -> Result<TaskRecord> {
        Ok(serde_json::from_str(document)?)
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn save_task(&self, record: &TaskRecord) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_task(&mut *conn, record).await
    }

    async fn load_task(&self, task_id: TaskId) -> Result<Option<TaskRecord>> {
        let row = sqlx::query("SELECT record FROM tasks WHERE task_id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            let document: String = row.try_get("record")?;
            Self::decode_task(&document)
        })
        .transpose()
    }

    async fn load_active_tasks(&self) -> Result<Vec<TaskRecord>> {
        let sql = format!(
            "SELECT record FROM tasks WHERE status NOT IN {TERMINAL_STATUSES} ORDER BY created_at"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| {
                let document: String = row.try_get("record")?;
                Self::decode_task(&document)
            })
            .collect()
    }

    async fn count_by_status(&self, since: DateTime<Utc>) -> Result<BTreeMap<TaskStatus, u64>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS total FROM tasks WHERE created_at >= ? GROUP BY status",
        )
        .bind(millis(since))
        .fetch_all(&self.pool)
        .await?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            let total: i64 = row.try_get("total")?;
            counts.insert(TaskStatus::from_str(&status)?, u64::try_from(total).unwrap_or_default());
        }
        Ok(counts)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<TaskId>> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT task_id FROM tasks WHERE status IN {TERMINAL_STATUSES} AND updated_at < ?"
        );
        let rows = sqlx::query(&sql)
            .bind(millis(cutoff))
            .fetch_all(&mut *tx)
            .await?;

        let mut purged = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.try_get("task_id")?;
            sqlx::query("DELETE FROM progress_events WHERE task_id = ?")
                .bind(&raw)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM tasks WHERE task_id = ?")
                .bind(&raw)
                .execute(&mut *tx)
                .await?;
            purged.push(TaskId::from_str(&raw)?);
        }

        tx.commit().await?;
        Ok(purged)
    }
}

#[async_trait]
impl EventLog for SqliteStore {
    async fn append_event(&self, event: &ProgressEvent) -> Result<()> {
        insert_event(&self.pool, event).await
    }

    async fn load_events(&self, task_id: TaskId, after: Option<u64>) -> Result<Vec<ProgressEvent>> {
        let after = after.map(|cursor| i64::try_from(cursor).unwrap_or(i64::MAX)).unwrap_or(-1);
        let rows = sqlx::query(
            "SELECT event FROM progress_events \
             WHERE task_id = ? AND sequence_number > ? \
             ORDER BY sequence_number",
        )
        .bind(task_id.to_string())
        .bind(after)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let document: String = row.try_get("event")?;
                Ok(serde_json::from_str(&document)?)
            })
            .collect()
    }
}

#[async_trait]
impl QuotaStore for SqliteStore {
    async fn save_quota(&self, entry: &QuotaEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO quota_entries (owner_id, active_count, quota_limit, last_seen_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(owner_id) DO UPDATE SET \
               active_count = excluded.active_count, \
               quota_limit = excluded.quota_limit, \
               last_seen_at = excluded.last_seen_at",
        )
        .bind(entry.owner_id.as_str())
        .bind(i64::from(entry.active_count))
        .bind(i64::from(entry.limit))
        .bind(millis(entry.last_seen_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_quotas(&self) -> Result<Vec<QuotaEntry>> {
        let rows = sqlx::query(
            "SELECT owner_id, active_count, quota_limit, last_seen_at FROM quota_entries",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let owner: String = row.try_get("owner_id")?;
                let active: i64 = row.try_get("active_count")?;
                let limit: i64 = row.try_get("quota_limit")?;
                let last_seen: i64 = row.try_get("last_seen_at")?;
                Ok(QuotaEntry {
                    owner_id: OwnerId::new(owner),
                    active_count: u32::try_from(active).unwrap_or_default(),
                    limit: u32::try_from(limit).unwrap_or_default(),
                    last_seen_at: from_millis(last_seen)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl OrchestratorStore for SqliteStore {
    async fn commit_transition(&self, record: &TaskRecord, event: &ProgressEvent) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_event(&mut *tx, event).await?;
        upsert_task(&mut *tx, record).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

async fn insert_event<'e, E>(executor: E, event: &ProgressEvent) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let document = serde_json::to_string(event)?;
    let result = sqlx::query(
        "INSERT INTO progress_events (task_id, sequence_number, emitted_at, event) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(event.task_id.to_string())
    .bind(i64::try_from(event.sequence_number).unwrap_or(i64::MAX))
    .bind(millis(event.emitted_at))
    .bind(document)
    .execute(executor)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
            Err(ConsistencyError::SequenceTaken {
                task_id: event.task_id,
                sequence: event.sequence_number,
            }
            .into())
        }
        Err(err) => Err(err.into()),
    }
}

/// Inserts or updates the task row. A row that is already terminal is never
/// overwritten.
async fn upsert_task(conn: &mut SqliteConnection, record: &TaskRecord) -> Result<()> {
    let document = serde_json::to_string(record)?;
    let sql = format!(
        "INSERT INTO tasks (task_id, owner_id, status, created_at, updated_at, record) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT(task_id) DO UPDATE SET \
           status = excluded.status, \
           updated_at = excluded.updated_at, \
           record = excluded.record \
         WHERE tasks.status NOT IN {TERMINAL_STATUSES}"
    );
    let written = sqlx::query(&sql)
        .bind(record.task_id.to_string())
        .bind(record.owner_id.as_str())
        .bind(record.status.as_str())
        .bind(millis(record.created_at))
        .bind(millis(record.updated_at))
        .bind(document)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    if written == 0 {
        let stored: String = sqlx::query_scalar("SELECT status FROM tasks WHERE task_id = ?")
            .bind(record.task_id.to_string())
            .fetch_one(&mut *conn)
            .await?;
        return Err(ConsistencyError::AlreadyTerminal {
            task_id: record.task_id,
            status: TaskStatus::from_str(&stored)?,
        }
        .into());
    }
    Ok(())
}
