//! The durable Job Queue: an in-memory runtime over the Job Store.
//!
//! Claims Pending jobs up to a concurrency bound, runs their handlers,
//! records outcomes, emits lifecycle events, and performs crash recovery at
//! startup. Generalizes the teacher's `services/legacy/job_queue.rs`
//! `WorkQueue<T>` (mpsc + `Semaphore`) from an in-memory fire-and-forget
//! queue into one backed by the Job Store, since jobs here must survive a
//! restart.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Decode;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::jobs::{AddJobOptions, JobRecord, JobStats};
use crate::db::requests::DeliveryTarget;
use crate::db::Database;
use crate::error::HandlerError;
use crate::events::{job_event_channel, JobEvent, JobEventReceiver, JobEventSender, JobEventStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    PipelineSearch,
    PipelineDownload,
    PipelineEncode,
    PipelineDeliver,
    PipelineRetryAwaiting,
    PipelineExecuteStep,
    TvSearch,
    TvDownloadSeason,
    TvDownloadEpisode,
    TvCheckNewEpisodes,
    LibrarySync,
    LibrarySyncServer,
    RatelimitCleanup,
}

impl JobType {
    pub const ALL: &'static [JobType] = &[
        JobType::PipelineSearch,
        JobType::PipelineDownload,
        JobType::PipelineEncode,
        JobType::PipelineDeliver,
        JobType::PipelineRetryAwaiting,
        JobType::PipelineExecuteStep,
        JobType::TvSearch,
        JobType::TvDownloadSeason,
        JobType::TvDownloadEpisode,
        JobType::TvCheckNewEpisodes,
        JobType::LibrarySync,
        JobType::LibrarySyncServer,
        JobType::RatelimitCleanup,
    ];
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobType::PipelineSearch => "pipeline:search",
            JobType::PipelineDownload => "pipeline:download",
            JobType::PipelineEncode => "pipeline:encode",
            JobType::PipelineDeliver => "pipeline:deliver",
            JobType::PipelineRetryAwaiting => "pipeline:retry-awaiting",
            JobType::PipelineExecuteStep => "pipeline:execute-step",
            JobType::TvSearch => "tv:search",
            JobType::TvDownloadSeason => "tv:download-season",
            JobType::TvDownloadEpisode => "tv:download-episode",
            JobType::TvCheckNewEpisodes => "tv:check-new-episodes",
            JobType::LibrarySync => "library:sync",
            JobType::LibrarySyncServer => "library:sync-server",
            JobType::RatelimitCleanup => "ratelimit:cleanup",
        };
        f.write_str(s)
    }
}

impl FromStr for JobType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "pipeline:search" => JobType::PipelineSearch,
            "pipeline:download" => JobType::PipelineDownload,
            "pipeline:encode" => JobType::PipelineEncode,
            "pipeline:deliver" => JobType::PipelineDeliver,
            "pipeline:retry-awaiting" => JobType::PipelineRetryAwaiting,
            "pipeline:execute-step" => JobType::PipelineExecuteStep,
            "tv:search" => JobType::TvSearch,
            "tv:download-season" => JobType::TvDownloadSeason,
            "tv:download-episode" => JobType::TvDownloadEpisode,
            "tv:check-new-episodes" => JobType::TvCheckNewEpisodes,
            "library:sync" => JobType::LibrarySync,
            "library:sync-server" => JobType::LibrarySyncServer,
            "ratelimit:cleanup" => JobType::RatelimitCleanup,
            other => return Err(anyhow!("unknown job type: {other}")),
        })
    }
}

impl sqlx::Type<sqlx::Postgres> for JobType {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <String as sqlx::Type<sqlx::Postgres>>::type_info()
    }
}

impl sqlx::Encode<'_, sqlx::Postgres> for JobType {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <String as sqlx::Encode<sqlx::Postgres>>::encode_by_ref(&self.to_string(), buf)
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for JobType {
    fn decode(
        value: sqlx::postgres::PgValueRef<'r>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let s = <String as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(JobType::from_str(&s)?)
    }
}

/// In-process decoding of `job.payload`, one variant per job type (spec.md
/// §9 "Dynamic payloads").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    PipelineSearch { request_id: Uuid },
    PipelineDownload { request_id: Uuid },
    PipelineEncode { request_id: Uuid, target: DeliveryTarget },
    PipelineDeliver { request_id: Uuid, target: DeliveryTarget },
    PipelineRetryAwaiting,
    PipelineExecuteStep { request_id: Uuid },
    TvSearch { request_id: Uuid },
    TvDownloadSeason { request_id: Uuid, season: i32 },
    TvDownloadEpisode { request_id: Uuid, processing_item_id: Uuid },
    TvCheckNewEpisodes { request_id: Uuid },
    LibrarySync,
    LibrarySyncServer { server_id: String },
    RatelimitCleanup,
}

/// Narrow interface handlers use to drive the Pipeline Executor, avoiding a
/// global reference for the Executor <-> Job Queue cyclic dependency
/// (spec.md §9).
#[async_trait]
pub trait ExecutorHandle: Send + Sync {
    async fn advance(&self, request_id: Uuid) -> Result<()>;
    async fn report_failure(&self, request_id: Uuid, error: &str) -> Result<()>;
}

/// Per-invocation context passed to a handler: store access, the event bus,
/// and the narrow Executor interface.
#[derive(Clone)]
pub struct JobContext {
    pub db: Database,
    pub events: JobEventSender,
    pub executor: Arc<dyn ExecutorHandle>,
    pub job_id: Uuid,
    pub job_type: JobType,
    pub request_id: Option<Uuid>,
}

impl JobContext {
    /// Handlers must poll this at least every few seconds in long loops
    /// (spec.md §5 "Suspension points").
    pub async fn is_cancelled(&self) -> bool {
        self.db.jobs().is_cancelled(self.job_id).await.unwrap_or(false)
    }

    pub async fn update_progress(&self, current: i64, total: i64) {
        if let Err(err) = self.db.jobs().update_progress(self.job_id, current, total).await {
            warn!(job_id = %self.job_id, error = %err, "failed to persist job progress");
        }
        let _ = self.events.send(JobEvent {
            id: self.job_id,
            job_type: self.job_type,
            status: JobEventStatus::Progress,
            progress_pct: Some(if total > 0 { current as f64 / total as f64 * 100.0 } else { 0.0 }),
            current: Some(current),
            total: Some(total),
            request_id: self.request_id,
            parent_job_id: None,
            dedupe_key: None,
            error: None,
            started_at: None,
            completed_at: None,
        });
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext, payload: JobPayload) -> Result<Value, HandlerError>;
}

pub type HandlerRegistry = HashMap<JobType, Arc<dyn JobHandler>>;

/// Default poll concurrency, matching spec.md §6 `jobs.concurrency` default.
pub const DEFAULT_CONCURRENCY: usize = 3;

pub struct JobQueue {
    db: Database,
    handlers: RwLock<HandlerRegistry>,
    executor: Arc<dyn ExecutorHandle>,
    concurrency: usize,
    semaphore: Arc<Semaphore>,
    running: Arc<RwLock<HashSet<Uuid>>>,
    worker_id: String,
    events_tx: JobEventSender,
}

impl JobQueue {
    pub fn new(db: Database, executor: Arc<dyn ExecutorHandle>, worker_id: String, concurrency: usize) -> Self {
        let (events_tx, _rx) = job_event_channel();
        Self {
            db,
            handlers: RwLock::new(HashMap::new()),
            executor,
            concurrency,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            running: Arc::new(RwLock::new(HashSet::new())),
            worker_id,
            events_tx,
        }
    }

    pub fn subscribe(&self) -> JobEventReceiver {
        self.events_tx.subscribe()
    }

    pub fn register_handler(&self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        self.handlers.write().insert(job_type, handler);
    }

    pub async fn add(&self, job_type: JobType, payload: &JobPayload, opts: AddJobOptions) -> Result<JobRecord> {
        let value = serde_json::to_value(payload)?;
        let record = self.db.jobs().add(job_type, value, opts).await?;
        self.emit(&record, JobEventStatus::Created);
        Ok(record)
    }

    /// Atomic with respect to `dedupe_key`: returns `None` if a non-terminal
    /// job already holds it (spec.md §8 property 8 / scenario S4).
    pub async fn add_if_not_exists(
        &self,
        job_type: JobType,
        payload: &JobPayload,
        dedupe_key: &str,
        opts: AddJobOptions,
    ) -> Result<Option<JobRecord>> {
        let value = serde_json::to_value(payload)?;
        let record = self.db.jobs().add_if_not_exists(job_type, value, dedupe_key, opts).await?;
        if let Some(record) = &record {
            self.emit(record, JobEventStatus::Created);
        }
        Ok(record)
    }

    /// One tick of the claim loop, registered with the Scheduler at
    /// `jobs.pollInterval` (spec.md §4.3 "Claim & run").
    pub async fn poll_and_dispatch(&self) {
        let available = self.semaphore.available_permits();
        if available == 0 {
            return;
        }

        let claimed = match self.db.jobs().claim_pending(available as i64, &self.worker_id).await {
            Ok(jobs) => jobs,
            Err(err) => {
                error!(error = %err, "failed to claim pending jobs");
                return;
            }
        };

        for record in claimed {
            self.emit(&record, JobEventStatus::Started);
            self.running.write().insert(record.id);
            self.spawn_handler(record);
        }
    }

    fn spawn_handler(&self, record: JobRecord) {
        let db = self.db.clone();
        let executor = self.executor.clone();
        let handlers = self.handlers.read().get(&record.job_type).cloned();
        let events_tx = self.events_tx.clone();
        let running = self.running.clone();
        let semaphore = self.semaphore.clone();
        let job_id = record.id;

        tokio::spawn(async move {
            let _permit = semaphore.try_acquire().ok();

            let Some(handler) = handlers else {
                error!(job_id = %job_id, job_type = %record.job_type, "no handler registered for job type");
                let _ = db
                    .jobs()
                    .mark_failed_or_retry(job_id, "no handler registered")
                    .await;
                running.write().remove(&job_id);
                return;
            };

            let payload: JobPayload = match serde_json::from_value(record.payload.clone()) {
                Ok(p) => p,
                Err(err) => {
                    error!(job_id = %job_id, error = %err, "failed to decode job payload");
                    let _ = db.jobs().mark_failed_or_retry(job_id, &err.to_string()).await;
                    running.write().remove(&job_id);
                    return;
                }
            };

            let ctx = JobContext {
                db: db.clone(),
                events: events_tx.clone(),
                executor: executor.clone(),
                job_id,
                job_type: record.job_type,
                request_id: record.request_id,
            };

            debug!(job_id = %job_id, job_type = %record.job_type, "dispatching job handler");
            let outcome = handler.handle(ctx, payload).await;

            let final_record = match outcome {
                Ok(result) => {
                    match db.jobs().mark_completed(job_id, result).await {
                        Ok(r) => Some((r, JobEventStatus::Completed)),
                        Err(err) => {
                            error!(job_id = %job_id, error = %err, "failed to persist job completion");
                            None
                        }
                    }
                }
                Err(HandlerError::Permanent(err)) => {
                    warn!(job_id = %job_id, error = %err, "job failed permanently");
                    // Permanent failures skip the retry budget: force attempts
                    // up to max so mark_failed_or_retry's CASE goes straight
                    // to terminal Failed instead of re-pending.
                    match db.jobs().mark_permanently_failed(job_id, &err.to_string()).await {
                        Ok(r) => Some((r, JobEventStatus::Failed)),
                        Err(err) => {
                            error!(job_id = %job_id, error = %err, "failed to persist permanent failure");
                            None
                        }
                    }
                }
                Err(HandlerError::Transient(err)) => {
                    warn!(job_id = %job_id, error = %err, "job failed transiently, will retry if attempts remain");
                    match db.jobs().mark_failed_or_retry(job_id, &err.to_string()).await {
                        // Still has attempts left: re-pended to Pending with
                        // a backoff delay, not a terminal failure yet.
                        Ok(r) if r.status.is_non_terminal() => None,
                        Ok(r) => Some((r, JobEventStatus::Failed)),
                        Err(err) => {
                            error!(job_id = %job_id, error = %err, "failed to persist transient failure");
                            None
                        }
                    }
                }
            };

            // Cancellation/pause disambiguation happens after handler exit:
            // a handler that observed the cancel flag and exited cleanly
            // still routes through the normal completion path above; the
            // cancel-specific terminal transition below only fires when the
            // handler was still marked cancel_requested in the store.
            if let Ok(Some(fresh)) = db.jobs().get(job_id).await {
                if fresh.cancel_requested && fresh.status != crate::db::jobs::JobStatus::Paused {
                    if let Ok(cancelled) = db.jobs().mark_cancelled(job_id, "Cancelled by user").await {
                        events_tx_emit(&events_tx, &cancelled, JobEventStatus::Cancelled);
                        running.write().remove(&job_id);
                        return;
                    }
                }
            }

            if let Some((record, status)) = final_record {
                events_tx_emit(&events_tx, &record, status);
            }
            running.write().remove(&job_id);
        });
    }

    /// Heartbeats every Running job owned by this worker; registered with
    /// the Scheduler on a 30s cadence (spec.md §4.3 "Heartbeats").
    pub async fn heartbeat_tick(&self) {
        if let Err(err) = self.db.jobs().heartbeat_all(&self.worker_id).await {
            error!(error = %err, "failed to refresh job heartbeats");
        }
        if let Err(err) = self.db.workers().heartbeat(&self.worker_id).await {
            error!(error = %err, "failed to refresh worker heartbeat");
        }
    }

    /// Reaps stale workers and re-pends their orphaned Running jobs;
    /// registered with the Scheduler alongside the heartbeat tick.
    pub async fn reap_stale_workers_tick(&self) {
        match self.db.workers().reap_stale().await {
            Ok(reaped) if !reaped.is_empty() => {
                info!(count = reaped.len(), "reaped stale workers");
                if let Err(err) = self.db.jobs().recover_crashed().await {
                    error!(error = %err, "failed to recover jobs from stale workers");
                }
            }
            Ok(_) => {}
            Err(err) => error!(error = %err, "failed to reap stale workers"),
        }
    }

    pub async fn request_cancel(&self, job_id: Uuid) -> Result<()> {
        if let Some(record) = self.db.jobs().request_cancel(job_id).await? {
            if record.status == crate::db::jobs::JobStatus::Cancelled {
                self.emit(&record, JobEventStatus::Cancelled);
            }
        }
        Ok(())
    }

    pub async fn pause(&self, job_id: Uuid) -> Result<()> {
        if let Some(record) = self.db.jobs().pause(job_id).await? {
            self.emit(&record, JobEventStatus::Progress);
        }
        Ok(())
    }

    pub async fn resume(&self, job_id: Uuid) -> Result<()> {
        self.db.jobs().resume(job_id).await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<JobStats> {
        self.db.jobs().stats().await
    }

    /// Crash recovery at startup (spec.md §4.3): register this worker, reap
    /// stale ones, and rewrite every job still Running under a stale owner
    /// back to Pending so the poll loop re-claims it.
    pub async fn recover_on_startup(&self, hostname: &str, pid: i32) -> Result<()> {
        self.db.workers().register(&self.worker_id, hostname, pid).await?;
        self.db.workers().reap_stale().await?;
        let recovered = self.db.jobs().recover_crashed().await?;
        if recovered > 0 {
            info!(count = recovered, "recovered jobs from a prior crash");
        }
        Ok(())
    }

    fn emit(&self, record: &JobRecord, status: JobEventStatus) {
        events_tx_emit(&self.events_tx, record, status);
    }
}

fn events_tx_emit(tx: &JobEventSender, record: &JobRecord, status: JobEventStatus) {
    let _ = tx.send(JobEvent {
        id: record.id,
        job_type: record.job_type,
        status,
        progress_pct: match (record.progress_current, record.progress_total) {
            (Some(c), Some(t)) if t > 0 => Some(c as f64 / t as f64 * 100.0),
            _ => None,
        },
        current: record.progress_current,
        total: record.progress_total,
        request_id: record.request_id,
        parent_job_id: record.parent_job_id,
        dedupe_key: record.dedupe_key.clone(),
        error: record.error.clone(),
        started_at: record.started_at,
        completed_at: record.completed_at,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_type_round_trips_through_display_and_from_str() {
        for job_type in JobType::ALL {
            let s = job_type.to_string();
            let parsed: JobType = s.parse().unwrap();
            assert_eq!(*job_type, parsed);
        }
    }

    #[test]
    fn job_type_rejects_unknown_string() {
        assert!("bogus:type".parse::<JobType>().is_err());
    }

    struct NullExecutor;

    #[async_trait]
    impl ExecutorHandle for NullExecutor {
        async fn advance(&self, _request_id: Uuid) -> Result<()> {
            Ok(())
        }
        async fn report_failure(&self, _request_id: Uuid, _error: &str) -> Result<()> {
            Ok(())
        }
    }

    struct EchoHandler;

    #[async_trait]
    impl JobHandler for EchoHandler {
        async fn handle(&self, _ctx: JobContext, _payload: JobPayload) -> Result<Value, HandlerError> {
            Ok(serde_json::json!({"ok": true}))
        }
    }

    struct AlwaysFailsHandler;

    #[async_trait]
    impl JobHandler for AlwaysFailsHandler {
        async fn handle(&self, _ctx: JobContext, _payload: JobPayload) -> Result<Value, HandlerError> {
            Err(HandlerError::Permanent(anyhow::anyhow!("deliberately broken")))
        }
    }

    async fn wait_for_terminal(queue: &JobQueue, job_id: Uuid) -> crate::db::jobs::JobRecord {
        for _ in 0..50 {
            if let Ok(Some(record)) = queue.db.jobs().get(job_id).await {
                if record.status.is_terminal() {
                    return record;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("job {job_id} never reached a terminal status");
    }

    #[sqlx::test]
    async fn poll_and_dispatch_runs_the_registered_handler_to_completion(pool: sqlx::PgPool) -> anyhow::Result<()> {
        let db = Database::from_pool(pool);
        let queue = JobQueue::new(db, Arc::new(NullExecutor), "test-worker".to_string(), 3);
        queue.register_handler(JobType::PipelineSearch, Arc::new(EchoHandler));

        let record = queue
            .add_if_not_exists(
                JobType::PipelineSearch,
                &JobPayload::PipelineSearch { request_id: Uuid::new_v4() },
                "pipeline:search:test",
                AddJobOptions::new(),
            )
            .await?
            .expect("first add must succeed");

        queue.poll_and_dispatch().await;
        let finished = wait_for_terminal(&queue, record.id).await;

        assert_eq!(finished.status, crate::db::jobs::JobStatus::Completed);
        assert_eq!(finished.result, Some(serde_json::json!({"ok": true})));
        Ok(())
    }

    #[sqlx::test]
    async fn poll_and_dispatch_marks_permanent_handler_errors_failed(pool: sqlx::PgPool) -> anyhow::Result<()> {
        let db = Database::from_pool(pool);
        let queue = JobQueue::new(db, Arc::new(NullExecutor), "test-worker".to_string(), 3);
        queue.register_handler(JobType::PipelineSearch, Arc::new(AlwaysFailsHandler));

        let record = queue
            .add_if_not_exists(
                JobType::PipelineSearch,
                &JobPayload::PipelineSearch { request_id: Uuid::new_v4() },
                "pipeline:search:test",
                AddJobOptions::new(),
            )
            .await?
            .expect("first add must succeed");

        queue.poll_and_dispatch().await;
        let finished = wait_for_terminal(&queue, record.id).await;

        assert_eq!(finished.status, crate::db::jobs::JobStatus::Failed);
        assert_eq!(finished.error.as_deref(), Some("deliberately broken"));
        Ok(())
    }
}
