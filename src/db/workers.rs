//! Worker self-registration and heartbeat tracking.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Stopped,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub hostname: String,
    pub pid: i32,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Workers whose `last_heartbeat` is older than this are reaped (spec.md §3).
pub const STALE_WORKER_THRESHOLD_MINUTES: i64 = 10;

pub struct WorkerRepository {
    pool: PgPool,
}

impl WorkerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn register(&self, worker_id: &str, hostname: &str, pid: i32) -> Result<WorkerRecord> {
        let record = sqlx::query_as::<_, WorkerRecord>(
            r#"
            INSERT INTO worker (worker_id, hostname, pid, status, last_heartbeat)
            VALUES ($1, $2, $3, 'active', now())
            ON CONFLICT (worker_id) DO UPDATE SET
                status = 'active',
                last_heartbeat = now(),
                updated_at = now()
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(hostname)
        .bind(pid)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn heartbeat(&self, worker_id: &str) -> Result<()> {
        sqlx::query("UPDATE worker SET last_heartbeat = now(), updated_at = now() WHERE worker_id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Marks workers whose `last_heartbeat` exceeds the stale threshold as
    /// Stopped. Their Running jobs are picked up separately by
    /// `JobRepository::recover_crashed`.
    pub async fn reap_stale(&self) -> Result<Vec<WorkerRecord>> {
        let reaped = sqlx::query_as::<_, WorkerRecord>(
            r#"
            UPDATE worker SET status = 'stopped', updated_at = now()
            WHERE status = 'active'
              AND last_heartbeat < now() - ($1 || ' minutes')::interval
            RETURNING *
            "#,
        )
        .bind(STALE_WORKER_THRESHOLD_MINUTES)
        .fetch_all(&self.pool)
        .await?;
        Ok(reaped)
    }

    pub async fn mark_stopped(&self, worker_id: &str) -> Result<()> {
        sqlx::query("UPDATE worker SET status = 'stopped', updated_at = now() WHERE worker_id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
