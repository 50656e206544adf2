//! Job persistence — the durable Job Store backing the Job Queue.
//!
//! Grounded on the teacher's `db/torrents.rs` repository shape (plain struct
//! + `Create*` input + thin repository over `PgPool`), generalized to the
//! richer Job Store fields spec.md §3 requires (priority, dedupe, heartbeat,
//! cancellation, pause/resume).

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::services::job_queue::JobType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn is_non_terminal(self) -> bool {
        !self.is_terminal()
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub job_type: JobType,
    pub payload: Value,
    pub priority: i32,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub dedupe_key: Option<String>,
    pub scheduled_for: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub cancel_requested: bool,
    pub error: Option<String>,
    pub result: Option<Value>,
    pub progress_current: Option<i64>,
    pub progress_total: Option<i64>,
    pub parent_job_id: Option<Uuid>,
    pub request_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct AddJobOptions {
    pub priority: i32,
    pub max_attempts: i32,
    pub dedupe_key: Option<String>,
    pub parent_job_id: Option<Uuid>,
    pub request_id: Option<Uuid>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl AddJobOptions {
    pub fn new() -> Self {
        Self {
            priority: 0,
            max_attempts: 3,
            dedupe_key: None,
            parent_job_id: None,
            request_id: None,
            scheduled_for: None,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct JobStats {
    pub pending: i64,
    pub running: i64,
    pub paused: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub pending_by_type: std::collections::HashMap<String, i64>,
}

pub struct JobRepository {
    pool: PgPool,
}

impl JobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Unconditional insert. Callers wanting dedupe semantics should use
    /// [`Self::add_if_not_exists`] instead.
    pub async fn add(&self, job_type: JobType, payload: Value, opts: AddJobOptions) -> Result<JobRecord> {
        let scheduled_for = opts.scheduled_for.unwrap_or_else(Utc::now);
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            INSERT INTO job (job_type, payload, priority, status, attempts, max_attempts, dedupe_key,
                              scheduled_for, parent_job_id, request_id, cancel_requested)
            VALUES ($1, $2, $3, 'pending', 0, $4, $5, $6, $7, $8, false)
            RETURNING *
            "#,
        )
        .bind(job_type)
        .bind(&payload)
        .bind(opts.priority)
        .bind(opts.max_attempts)
        .bind(&opts.dedupe_key)
        .bind(scheduled_for)
        .bind(opts.parent_job_id)
        .bind(opts.request_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    /// Atomic with respect to `dedupe_key`: if a non-terminal job already
    /// holds the key, returns `None` without inserting. Relies on the
    /// partial unique index `job_dedupe_key_active_idx` (see migrations);
    /// a unique-violation on insert is treated the same as "already exists"
    /// to close the TOCTOU window between the pre-check and the insert.
    pub async fn add_if_not_exists(
        &self,
        job_type: JobType,
        payload: Value,
        dedupe_key: &str,
        opts: AddJobOptions,
    ) -> Result<Option<JobRecord>> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_scalar::<_, i64>(
            "SELECT count(*) FROM job WHERE dedupe_key = $1 AND status IN ('pending', 'running', 'paused')",
        )
        .bind(dedupe_key)
        .fetch_one(&mut *tx)
        .await?;

        if existing > 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let scheduled_for = opts.scheduled_for.unwrap_or_else(Utc::now);
        let inserted = sqlx::query_as::<_, JobRecord>(
            r#"
            INSERT INTO job (job_type, payload, priority, status, attempts, max_attempts, dedupe_key,
                              scheduled_for, parent_job_id, request_id, cancel_requested)
            VALUES ($1, $2, $3, 'pending', 0, $4, $5, $6, $7, $8, false)
            ON CONFLICT (dedupe_key) WHERE status IN ('pending', 'running', 'paused') DO NOTHING
            RETURNING *
            "#,
        )
        .bind(job_type)
        .bind(&payload)
        .bind(opts.priority)
        .bind(opts.max_attempts)
        .bind(dedupe_key)
        .bind(scheduled_for)
        .bind(opts.parent_job_id)
        .bind(opts.request_id)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<JobRecord>> {
        let record = sqlx::query_as::<_, JobRecord>("SELECT * FROM job WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    /// Claims up to `limit` Pending jobs due to run, ordered by
    /// `priority DESC, created_at ASC`, transitioning each to Running.
    /// The `UPDATE ... WHERE status = 'pending'` guard makes the claim
    /// race-safe across workers without a general lock.
    pub async fn claim_pending(&self, limit: i64, worker_id: &str) -> Result<Vec<JobRecord>> {
        let claimed = sqlx::query_as::<_, JobRecord>(
            r#"
            WITH candidates AS (
                SELECT id FROM job
                WHERE status = 'pending' AND scheduled_for <= now()
                ORDER BY priority DESC, created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE job
            SET status = 'running',
                started_at = now(),
                heartbeat_at = now(),
                worker_id = $2,
                attempts = attempts + 1,
                updated_at = now()
            WHERE id IN (SELECT id FROM candidates)
            RETURNING *
            "#,
        )
        .bind(limit)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(claimed)
    }

    pub async fn mark_completed(&self, id: Uuid, result: Value) -> Result<JobRecord> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE job SET status = 'completed', result = $2, completed_at = now(), updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(result)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    /// Transition for a handler error: re-pend with exponential backoff if
    /// attempts remain, else terminal Failed.
    pub async fn mark_failed_or_retry(
        &self,
        id: Uuid,
        error: &str,
    ) -> Result<JobRecord> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE job SET
                status = CASE WHEN attempts < max_attempts THEN 'pending' ELSE 'failed' END,
                error = $2,
                scheduled_for = CASE WHEN attempts < max_attempts
                    THEN now() + (power(2, attempts) || ' seconds')::interval
                    ELSE scheduled_for END,
                started_at = CASE WHEN attempts < max_attempts THEN NULL ELSE started_at END,
                heartbeat_at = CASE WHEN attempts < max_attempts THEN NULL ELSE heartbeat_at END,
                worker_id = CASE WHEN attempts < max_attempts THEN NULL ELSE worker_id END,
                completed_at = CASE WHEN attempts < max_attempts THEN NULL ELSE now() END,
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(error)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    /// Terminal Failed regardless of remaining attempts (spec.md §7
    /// "Permanent upstream" — doesn't consume retry budget on doomed work).
    pub async fn mark_permanently_failed(&self, id: Uuid, error: &str) -> Result<JobRecord> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE job SET status = 'failed', error = $2, completed_at = now(), updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(error)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn mark_cancelled(&self, id: Uuid, error: &str) -> Result<JobRecord> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE job SET status = 'cancelled', error = $2, completed_at = now(), updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(error)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn request_cancel(&self, id: Uuid) -> Result<Option<JobRecord>> {
        // Pending jobs cancel immediately; Running jobs only get the flag set,
        // the runner observes it cooperatively.
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE job SET
                status = CASE WHEN status = 'pending' THEN 'cancelled' ELSE status END,
                cancel_requested = true,
                completed_at = CASE WHEN status = 'pending' THEN now() ELSE completed_at END,
                error = CASE WHEN status = 'pending' THEN 'Cancelled by user' ELSE error END,
                updated_at = now()
            WHERE id = $1 AND status IN ('pending', 'running')
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn pause(&self, id: Uuid) -> Result<Option<JobRecord>> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE job SET
                status = 'paused',
                cancel_requested = CASE WHEN status = 'running' THEN true ELSE cancel_requested END,
                updated_at = now()
            WHERE id = $1 AND status IN ('pending', 'running')
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn resume(&self, id: Uuid) -> Result<Option<JobRecord>> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE job SET
                status = 'pending',
                started_at = NULL,
                heartbeat_at = NULL,
                worker_id = NULL,
                cancel_requested = false,
                scheduled_for = now(),
                updated_at = now()
            WHERE id = $1 AND status = 'paused'
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn update_progress(&self, id: Uuid, current: i64, total: i64) -> Result<()> {
        sqlx::query(
            "UPDATE job SET progress_current = $2, progress_total = $3, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(current)
        .bind(total)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Refreshes `heartbeat_at` for every Running job owned by `worker_id`.
    pub async fn heartbeat_all(&self, worker_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE job SET heartbeat_at = now() WHERE status = 'running' AND worker_id = $1",
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Reads the in-memory cancel cache back from the store: Running jobs
    /// with `cancel_requested = true`, so cancels survive a process restart.
    pub async fn cancelled_job_ids(&self) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM job WHERE status = 'running' AND cancel_requested = true",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    pub async fn is_cancelled(&self, id: Uuid) -> Result<bool> {
        let flag = sqlx::query_scalar::<_, bool>("SELECT cancel_requested FROM job WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(flag.unwrap_or(false))
    }

    /// Rewrites every Running job owned by a now-stale worker back to
    /// Pending, clearing ownership fields. Called once at startup per
    /// spec.md §4.3 "Crash recovery at startup".
    pub async fn recover_crashed(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE job SET
                status = 'pending',
                started_at = NULL,
                heartbeat_at = NULL,
                worker_id = NULL,
                cancel_requested = false,
                updated_at = now()
            WHERE status = 'running'
              AND worker_id IN (SELECT worker_id FROM worker WHERE status = 'stopped')
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// All jobs of a given type for a request, newest first. Used by the
    /// Executor to aggregate per-target ENCODE/DELIVER sub-job outcomes.
    pub async fn list_for_request(&self, request_id: Uuid, job_type: JobType) -> Result<Vec<JobRecord>> {
        let records = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM job WHERE request_id = $1 AND job_type = $2 ORDER BY created_at DESC",
        )
        .bind(request_id)
        .bind(job_type)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn stats(&self) -> Result<JobStats> {
        #[derive(sqlx::FromRow)]
        struct StatusCount {
            status: JobStatus,
            count: i64,
        }
        let counts: Vec<StatusCount> = sqlx::query_as(
            "SELECT status, count(*) as count FROM job GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = JobStats::default();
        for row in counts {
            match row.status {
                JobStatus::Pending => stats.pending = row.count,
                JobStatus::Running => stats.running = row.count,
                JobStatus::Paused => stats.paused = row.count,
                JobStatus::Completed => stats.completed = row.count,
                JobStatus::Failed => stats.failed = row.count,
                JobStatus::Cancelled => stats.cancelled = row.count,
            }
        }

        #[derive(sqlx::FromRow)]
        struct TypeCount {
            job_type: JobType,
            count: i64,
        }
        let by_type: Vec<TypeCount> = sqlx::query_as(
            "SELECT job_type, count(*) as count FROM job WHERE status = 'pending' GROUP BY job_type",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in by_type {
            stats.pending_by_type.insert(row.job_type.to_string(), row.count);
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sqlx::PgPool;

    #[sqlx::test]
    async fn add_if_not_exists_is_dedupe_idempotent(pool: PgPool) -> anyhow::Result<()> {
        let repo = JobRepository::new(pool);
        let opts = AddJobOptions::new();

        let first = repo
            .add_if_not_exists(JobType::PipelineSearch, serde_json::json!({"requestId": "r1"}), "pipeline:search:r1", opts)
            .await?;
        assert!(first.is_some());

        let opts = AddJobOptions::new();
        let second = repo
            .add_if_not_exists(JobType::PipelineSearch, serde_json::json!({"requestId": "r1"}), "pipeline:search:r1", opts)
            .await?;
        assert!(second.is_none(), "second add with the same dedupe key while the first is non-terminal must be a no-op");

        let stats = repo.stats().await?;
        assert_eq!(stats.pending, 1);
        Ok(())
    }

    #[sqlx::test]
    async fn add_if_not_exists_allows_reuse_once_prior_job_is_terminal(pool: PgPool) -> anyhow::Result<()> {
        let repo = JobRepository::new(pool);

        let opts = AddJobOptions::new();
        let first = repo
            .add_if_not_exists(JobType::PipelineSearch, serde_json::json!({}), "pipeline:search:r1", opts)
            .await?
            .unwrap();
        repo.mark_completed(first.id, serde_json::json!({})).await?;

        let opts = AddJobOptions::new();
        let second = repo
            .add_if_not_exists(JobType::PipelineSearch, serde_json::json!({}), "pipeline:search:r1", opts)
            .await?;
        assert!(second.is_some(), "a completed job must not block reuse of its dedupe key");
        Ok(())
    }

    #[sqlx::test]
    async fn claim_pending_respects_the_requested_limit(pool: PgPool) -> anyhow::Result<()> {
        let repo = JobRepository::new(pool);
        for i in 0..5 {
            repo.add(JobType::PipelineSearch, serde_json::json!({"i": i}), AddJobOptions::new()).await?;
        }

        let claimed = repo.claim_pending(2, "worker-a").await?;
        assert_eq!(claimed.len(), 2, "claim must never take more than the concurrency ceiling allows");
        for job in &claimed {
            assert_eq!(job.status, JobStatus::Running);
        }

        let stats = repo.stats().await?;
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.running, 2);
        Ok(())
    }

    #[sqlx::test]
    async fn recover_crashed_repends_jobs_owned_by_a_stopped_worker(pool: PgPool) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO worker (worker_id, hostname, pid, status, last_heartbeat) VALUES ($1, 'host', 1, 'stopped', now())",
        )
        .bind("crashed-worker")
        .execute(&pool)
        .await?;

        let repo = JobRepository::new(pool.clone());
        let job = repo.add(JobType::PipelineSearch, serde_json::json!({}), AddJobOptions::new()).await?;
        sqlx::query(
            "UPDATE job SET status = 'running', worker_id = $2, started_at = now(), heartbeat_at = now() WHERE id = $1",
        )
        .bind(job.id)
        .bind("crashed-worker")
        .execute(&pool)
        .await?;

        let recovered = repo.recover_crashed().await?;
        assert_eq!(recovered, 1);

        let fresh = repo.get(job.id).await?.unwrap();
        assert_eq!(fresh.status, JobStatus::Pending);
        assert!(fresh.worker_id.is_none());
        Ok(())
    }
}
