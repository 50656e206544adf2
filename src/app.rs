//! Wires config, storage, and every service into a running instance.
//! Mirrors the teacher's `main.rs`/`AppState` construction — one function
//! builds the graph, `run` starts every background task and blocks.

use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::{UnconfiguredDownloadClient, UnconfiguredMediaServerAdapter};
use crate::config::Config;
use crate::db::jobs::AddJobOptions;
use crate::db::Database;
use crate::events::approval_event_channel;
use crate::services::announce::irc::{IrcConfig, IrcListener};
use crate::services::announce::rss::RssPoller;
use crate::services::announce::AnnounceMatcher;
use crate::services::indexer::fanout::IndexerFanout;
use crate::services::job_queue::{ExecutorHandle, JobPayload, JobQueue, JobType};
use crate::services::library_sync::{LibrarySyncHandler, LibrarySyncServerHandler, RatelimitCleanupHandler};
use crate::services::pipeline::approval::ApprovalGate;
use crate::services::pipeline::executor::{
    DeliverHandler, DownloadHandler, EncodeHandler, ExecuteStepHandler, PipelineExecutor,
    RetryAwaitingHandler, SearchHandler, TvCheckNewEpisodesHandler, TvDownloadEpisodeHandler,
    TvDownloadSeasonHandler, TvSearchHandler,
};
use crate::services::rate_limiter::RateLimiterRegistry;
use crate::services::scheduler::Scheduler;

/// Breaks the Executor <-> JobQueue cyclic dependency (spec.md §9): the
/// queue is constructed with this handle before the executor it wraps
/// exists, then [`ExecutorHandleCell::bind`] plugs it in once built.
struct ExecutorHandleCell(OnceCell<Arc<PipelineExecutor>>);

impl ExecutorHandleCell {
    fn new() -> Self {
        Self(OnceCell::new())
    }

    fn bind(&self, executor: Arc<PipelineExecutor>) {
        self.0.set(executor).ok().expect("executor handle bound twice");
    }

    fn get(&self) -> &Arc<PipelineExecutor> {
        self.0.get().expect("executor handle used before bootstrap finished wiring it")
    }
}

#[async_trait::async_trait]
impl ExecutorHandle for ExecutorHandleCell {
    async fn advance(&self, request_id: Uuid) -> Result<()> {
        ExecutorHandle::advance(self.get().as_ref(), request_id).await
    }

    async fn report_failure(&self, request_id: Uuid, error: &str) -> Result<()> {
        ExecutorHandle::report_failure(self.get().as_ref(), request_id, error).await
    }
}

pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub queue: Arc<JobQueue>,
    pub scheduler: Arc<Scheduler>,
    pub executor: Arc<PipelineExecutor>,
    pub approval_gate: Arc<ApprovalGate>,
    pub rate_limiters: Arc<RateLimiterRegistry>,
    rss_poller: Option<Arc<RssPoller>>,
    irc_listener: Option<Arc<IrcListener>>,
}

impl AppState {
    /// Connects to Postgres, runs migrations, and wires every service
    /// together. Does not start the scheduler or recover crashed jobs —
    /// call [`AppState::start`] for that.
    pub async fn bootstrap(config: Config) -> Result<Self> {
        let db = Database::connect(&config.database_url).await?;
        db.migrate().await?;

        let worker_id = format!(
            "{}:{}:{}",
            config.worker_hostname,
            std::process::id(),
            chrono::Utc::now().timestamp()
        );

        let executor_handle = Arc::new(ExecutorHandleCell::new());
        let queue = Arc::new(JobQueue::new(
            db.clone(),
            executor_handle.clone(),
            worker_id,
            config.jobs_concurrency,
        ));

        let fanout = Arc::new(IndexerFanout::new(Vec::new()));
        let download_client = Arc::new(UnconfiguredDownloadClient);
        let media_server = Arc::new(UnconfiguredMediaServerAdapter);
        let executor = Arc::new(PipelineExecutor::new(
            db.clone(),
            queue.clone(),
            fanout,
            download_client,
            media_server,
        ));
        executor_handle.bind(executor.clone());

        let (approval_events, _rx) = approval_event_channel();
        let approval_gate = Arc::new(ApprovalGate::new(db.clone(), executor_handle.clone(), approval_events));

        let rate_limiters = Arc::new(RateLimiterRegistry::new(config.rate_limiter_capacities.clone()));
        let rate_limiter_names: Vec<String> = config.rate_limiter_capacities.keys().cloned().collect();

        register_handlers(&queue, &executor, &db, &rate_limiters, rate_limiter_names);

        let matcher = Arc::new(AnnounceMatcher::new(db.clone(), queue.clone()));
        let rss_poller = config.rss_enabled.then(|| Arc::new(RssPoller::new(config.rss_feed_urls.clone(), matcher.clone())));
        let irc_listener = config
            .irc_enabled
            .then(|| Arc::new(IrcListener::new(IrcConfig::from(&config), matcher.clone())));

        Ok(Self {
            config,
            db,
            queue,
            scheduler: Arc::new(Scheduler::new()),
            executor,
            approval_gate,
            rate_limiters,
            rss_poller,
            irc_listener,
        })
    }

    /// Recovers crashed jobs, registers every recurring task with the
    /// Scheduler, and spawns the long-lived IRC listener task. Returns once
    /// everything is scheduled; the caller decides how to keep the process
    /// alive (`tokio::signal::ctrl_c`, in `main.rs`).
    pub async fn start(&self) -> Result<()> {
        self.queue.recover_on_startup(&self.config.worker_hostname, std::process::id() as i32).await?;

        let queue = self.queue.clone();
        self.scheduler.register("job-queue-poll", "Job Queue Poll", self.config.jobs_poll_interval.as_millis() as u64, move || {
            let queue = queue.clone();
            async move { queue.poll_and_dispatch().await }
        });

        let queue = self.queue.clone();
        self.scheduler.register("job-queue-heartbeat", "Job Queue Heartbeat + Stale Reap", 30_000, move || {
            let queue = queue.clone();
            async move {
                queue.heartbeat_tick().await;
                queue.reap_stale_workers_tick().await;
            }
        });

        let queue = self.queue.clone();
        self.scheduler.register("pipeline-retry-awaiting", "Awaiting Retry Enqueue", 60_000, move || {
            let queue = queue.clone();
            async move {
                let opts = AddJobOptions::new();
                if let Err(err) = queue
                    .add_if_not_exists(
                        JobType::PipelineRetryAwaiting,
                        &JobPayload::PipelineRetryAwaiting,
                        "pipeline:retry-awaiting",
                        opts,
                    )
                    .await
                {
                    warn!(error = %err, "failed to enqueue pipeline:retry-awaiting");
                }
            }
        });

        let approval_gate = self.approval_gate.clone();
        self.scheduler.register("approval-check-timeouts", "Approval Timeout Check", 5 * 60_000, move || {
            let approval_gate = approval_gate.clone();
            async move {
                if let Err(err) = approval_gate.check_timeouts().await {
                    warn!(error = %err, "failed to check approval timeouts");
                }
            }
        });

        let queue = self.queue.clone();
        self.scheduler.register("library-sync", "Library Sync Fanout", 6 * 60 * 60_000, move || {
            let queue = queue.clone();
            async move {
                let opts = AddJobOptions::new();
                if let Err(err) = queue
                    .add_if_not_exists(JobType::LibrarySync, &JobPayload::LibrarySync, "library:sync", opts)
                    .await
                {
                    warn!(error = %err, "failed to enqueue library:sync");
                }
            }
        });

        let queue = self.queue.clone();
        self.scheduler.register("ratelimit-cleanup", "Rate Limiter Bucket Reset", 24 * 60 * 60_000, move || {
            let queue = queue.clone();
            async move {
                let opts = AddJobOptions::new();
                if let Err(err) = queue
                    .add_if_not_exists(JobType::RatelimitCleanup, &JobPayload::RatelimitCleanup, "ratelimit:cleanup", opts)
                    .await
                {
                    warn!(error = %err, "failed to enqueue ratelimit:cleanup");
                }
            }
        });

        let scheduler = self.scheduler.clone();
        self.scheduler.register("scheduler-summary", "Scheduler Self-Maintenance Summary", 5 * 60_000, move || {
            let scheduler = scheduler.clone();
            async move {
                for task in scheduler.summary() {
                    info!(task = %task.task_id, label = %task.label, interval_ms = task.interval_ms, running = task.currently_running, "scheduled task status");
                }
            }
        });

        if let Some(rss_poller) = &self.rss_poller {
            let rss_poller = rss_poller.clone();
            self.scheduler.register("rss-poll", "RSS Announce Poll", self.config.rss_poll_interval.as_millis() as u64, move || {
                let rss_poller = rss_poller.clone();
                async move {
                    if let Err(err) = rss_poller.poll_tick().await {
                        warn!(error = %err, "rss poll tick failed");
                    }
                }
            });
        }

        if let Some(irc_listener) = &self.irc_listener {
            let irc_listener = irc_listener.clone();
            tokio::spawn(async move {
                irc_listener.run().await;
            });
        }

        info!("harvestd started");
        Ok(())
    }
}

fn register_handlers(
    queue: &Arc<JobQueue>,
    executor: &Arc<PipelineExecutor>,
    db: &Database,
    rate_limiters: &Arc<RateLimiterRegistry>,
    rate_limiter_names: Vec<String>,
) {
    queue.register_handler(JobType::PipelineExecuteStep, Arc::new(ExecuteStepHandler { executor: executor.clone() }));
    queue.register_handler(JobType::PipelineSearch, Arc::new(SearchHandler { executor: executor.clone() }));
    queue.register_handler(JobType::PipelineDownload, Arc::new(DownloadHandler { executor: executor.clone() }));
    queue.register_handler(JobType::PipelineEncode, Arc::new(EncodeHandler { executor: executor.clone() }));
    queue.register_handler(JobType::PipelineDeliver, Arc::new(DeliverHandler { executor: executor.clone() }));
    queue.register_handler(JobType::PipelineRetryAwaiting, Arc::new(RetryAwaitingHandler { executor: executor.clone() }));
    queue.register_handler(JobType::TvSearch, Arc::new(TvSearchHandler { executor: executor.clone() }));
    queue.register_handler(JobType::TvDownloadSeason, Arc::new(TvDownloadSeasonHandler { executor: executor.clone() }));
    queue.register_handler(JobType::TvDownloadEpisode, Arc::new(TvDownloadEpisodeHandler { executor: executor.clone() }));
    queue.register_handler(JobType::TvCheckNewEpisodes, Arc::new(TvCheckNewEpisodesHandler));
    queue.register_handler(
        JobType::LibrarySync,
        Arc::new(LibrarySyncHandler { db: db.clone(), queue: queue.clone() }),
    );
    queue.register_handler(JobType::LibrarySyncServer, Arc::new(LibrarySyncServerHandler { db: db.clone() }));
    queue.register_handler(
        JobType::RatelimitCleanup,
        Arc::new(RatelimitCleanupHandler { limiters: rate_limiters.clone(), names: rate_limiter_names }),
    );
}
