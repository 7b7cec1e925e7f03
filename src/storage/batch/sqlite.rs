use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::info;

use super::BatchStore;
use crate::schedule::types::BatchRecord;

pub struct SqliteBatchStore {
    pool: SqlitePool,
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn parse_optional_time(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_time).transpose()
}

impl SqliteBatchStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        info!("Initializing SQLite batch storage at {}", database_url);
        let pool = SqlitePool::connect(database_url).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS batches (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                state TEXT NOT NULL,
                max_concurrent INTEGER NOT NULL,
                jobs TEXT NOT NULL,
                callback_url TEXT,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    fn row_to_batch(row: sqlx::sqlite::SqliteRow) -> Result<BatchRecord> {
        let state: String = row.get("state");
        let jobs: String = row.get("jobs");
        let max_concurrent: i64 = row.get("max_concurrent");
        let created_at: String = row.get("created_at");

        Ok(BatchRecord {
            id: row.get("id"),
            name: row.get("name"),
            max_concurrent: usize::try_from(max_concurrent)?,
            jobs: serde_json::from_str(&jobs)?,
            state: serde_json::from_str(&state)?,
            created_at: parse_time(&created_at)?,
            started_at: parse_optional_time(row.get("started_at"))?,
            finished_at: parse_optional_time(row.get("finished_at"))?,
            callback_url: row.get("callback_url"),
            cancel_requested: row.get("cancel_requested"),
        })
    }
}

#[async_trait]
impl BatchStore for SqliteBatchStore {
    async fn save(&self, batch: &BatchRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO batches
            (id, name, state, max_concurrent, jobs, callback_url, cancel_requested, created_at, started_at, finished_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                state = excluded.state,
                max_concurrent = excluded.max_concurrent,
                jobs = excluded.jobs,
                callback_url = excluded.callback_url,
                cancel_requested = excluded.cancel_requested,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&batch.id)
        .bind(&batch.name)
        .bind(serde_json::to_string(&batch.state)?)
        .bind(i64::try_from(batch.max_concurrent)?)
        .bind(serde_json::to_string(&batch.jobs)?)
        .bind(&batch.callback_url)
        .bind(batch.cancel_requested)
        .bind(batch.created_at.to_rfc3339())
        .bind(batch.started_at.map(|t| t.to_rfc3339()))
        .bind(batch.finished_at.map(|t| t.to_rfc3339()))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, batch_id: &str) -> Result<Option<BatchRecord>> {
        let row = sqlx::query("SELECT * FROM batches WHERE id = ?")
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_batch).transpose()
    }

    async fn list(&self) -> Result<Vec<BatchRecord>> {
        let rows = sqlx::query("SELECT * FROM batches ORDER BY created_at ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::row_to_batch).collect()
    }

    async fn delete(&self, batch_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM batches WHERE id = ?")
            .bind(batch_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
