//! Resumable cursor storage for long-running hydration/sync jobs.
//!
//! One row per named sync stream (e.g. `library:sync:plex`), so the job
//! queue's crash recovery can surface in-flight cursors at startup.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct SyncStateRecord {
    pub name: String,
    pub last_processed_external_id: Option<String>,
    pub total_count: Option<i64>,
    pub active_job_id: Option<Uuid>,
    pub cursor: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

pub struct SyncStateRepository {
    pool: PgPool,
}

impl SyncStateRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, name: &str) -> Result<Option<SyncStateRecord>> {
        let record = sqlx::query_as::<_, SyncStateRecord>("SELECT * FROM sync_state WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    pub async fn upsert(
        &self,
        name: &str,
        last_processed_external_id: Option<&str>,
        total_count: Option<i64>,
        active_job_id: Option<Uuid>,
        cursor: Option<Value>,
    ) -> Result<SyncStateRecord> {
        let record = sqlx::query_as::<_, SyncStateRecord>(
            r#"
            INSERT INTO sync_state (name, last_processed_external_id, total_count, active_job_id, cursor)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (name) DO UPDATE SET
                last_processed_external_id = EXCLUDED.last_processed_external_id,
                total_count = EXCLUDED.total_count,
                active_job_id = EXCLUDED.active_job_id,
                cursor = EXCLUDED.cursor,
                updated_at = now()
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(last_processed_external_id)
        .bind(total_count)
        .bind(active_job_id)
        .bind(cursor)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn clear_active_job(&self, name: &str) -> Result<()> {
        sqlx::query("UPDATE sync_state SET active_job_id = NULL, updated_at = now() WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
