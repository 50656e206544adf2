//! The Pipeline Executor: owns the Request/ProcessingItem state machine
//! (spec.md §4.6) and the job handlers that carry out each concrete stage.
//!
//! `pipeline:execute-step` is the dispatcher: it never does I/O against an
//! external collaborator itself, it only inspects store state and enqueues
//! the next concrete job. This keeps SEARCH/DOWNLOAD/ENCODE/DELIVER
//! handlers small and makes re-running the dispatcher idempotent (spec.md
//! §8 property 9) since every concrete enqueue goes through
//! `add_if_not_exists` keyed by a stage-specific dedupe key.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::approvals::{AutoAction, CreateApproval};
use crate::db::jobs::AddJobOptions;
use crate::db::processing_items::ProcessingItemRecord;
use crate::db::requests::{DeliveryTarget, MediaKind, RequestRecord, RequestStatus};
use crate::db::Database;
use crate::error::HandlerError;
use crate::services::download::{AddDownloadOptions, DownloadClient, DownloadSource, DownloadState};
use crate::services::indexer::fanout::IndexerFanout;
use crate::services::indexer::{IndexerQuery, MediaKind as IndexerMediaKind};
use crate::services::job_queue::{
    ExecutorHandle, JobContext, JobHandler, JobPayload, JobQueue, JobType,
};
use crate::services::media_server::MediaServerAdapter;
use crate::services::quality::{select, Release, Resolution, SelectionConstraints};

const APPROVAL_REQUIRED_KEY: &str = "search.approvalRequired";
const APPROVAL_TIMEOUT_HOURS_KEY: &str = "search.approvalTimeoutHours";
const SEARCH_RETRY_INTERVAL_HOURS_KEY: &str = "search.retryIntervalHours";

/// Poll period while a job handler waits on an external download client
/// (spec.md §5 "Suspension points" — a suspension point the handler must
/// periodically revisit to check cancellation and report progress).
const DOWNLOAD_POLL_INTERVAL: Duration = Duration::from_secs(5);

fn parse_resolution(s: &str) -> Option<Resolution> {
    serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
}

fn to_indexer_kind(kind: MediaKind) -> IndexerMediaKind {
    match kind {
        MediaKind::Movie => IndexerMediaKind::Movie,
        MediaKind::Series => IndexerMediaKind::Series,
    }
}

fn release_source(release: &Release) -> Result<DownloadSource> {
    if let Some(url) = &release.download_url {
        Ok(DownloadSource::Url(url.clone()))
    } else if let Some(magnet) = &release.magnet_uri {
        Ok(DownloadSource::Magnet(magnet.clone()))
    } else {
        Err(anyhow!("release {} has no acquisition url", release.title))
    }
}

/// Central state machine owner, shared by every `pipeline:*`/`tv:*` job
/// handler and passed around as `Arc<PipelineExecutor>`.
pub struct PipelineExecutor {
    db: Database,
    queue: Arc<JobQueue>,
    fanout: Arc<IndexerFanout>,
    download_client: Arc<dyn DownloadClient>,
    media_server: Arc<dyn MediaServerAdapter>,
}

impl PipelineExecutor {
    pub fn new(
        db: Database,
        queue: Arc<JobQueue>,
        fanout: Arc<IndexerFanout>,
        download_client: Arc<dyn DownloadClient>,
        media_server: Arc<dyn MediaServerAdapter>,
    ) -> Self {
        Self { db, queue, fanout, download_client, media_server }
    }

    async fn approval_required(&self) -> Result<bool> {
        self.db.settings().get_or_default(APPROVAL_REQUIRED_KEY, false).await
    }

    async fn approval_timeout_hours(&self) -> Result<f64> {
        self.db.settings().get_or_default(APPROVAL_TIMEOUT_HOURS_KEY, 24.0).await
    }

    async fn search_retry_interval_hours(&self) -> Result<f64> {
        self.db.settings().get_or_default(SEARCH_RETRY_INTERVAL_HOURS_KEY, 6.0).await
    }

    async fn enqueue_execute_step(&self, request_id: Uuid) -> Result<()> {
        let opts = AddJobOptions { priority: 5, request_id: Some(request_id), ..AddJobOptions::new() };
        self.queue
            .add_if_not_exists(
                JobType::PipelineExecuteStep,
                &JobPayload::PipelineExecuteStep { request_id },
                &format!("pipeline:execute-step:{request_id}"),
                opts,
            )
            .await?;
        Ok(())
    }

    async fn enqueue_search(&self, request_id: Uuid) -> Result<()> {
        let opts = AddJobOptions { request_id: Some(request_id), ..AddJobOptions::new() };
        self.queue
            .add_if_not_exists(
                JobType::PipelineSearch,
                &JobPayload::PipelineSearch { request_id },
                &format!("pipeline:search:{request_id}"),
                opts,
            )
            .await?;
        Ok(())
    }

    async fn enqueue_download(&self, request_id: Uuid) -> Result<()> {
        let opts = AddJobOptions { request_id: Some(request_id), ..AddJobOptions::new() };
        self.queue
            .add_if_not_exists(
                JobType::PipelineDownload,
                &JobPayload::PipelineDownload { request_id },
                &format!("pipeline:download:{request_id}"),
                opts,
            )
            .await?;
        Ok(())
    }

    async fn ensure_target_jobs(&self, request: &RequestRecord, job_type: JobType) -> Result<()> {
        let targets: Vec<DeliveryTarget> = serde_json::from_value(request.targets.clone())?;
        for target in &targets {
            let dedupe = format!("{job_type}:{}:{}", request.id, target.server_id);
            let opts = AddJobOptions { request_id: Some(request.id), ..AddJobOptions::new() };
            let payload = match job_type {
                JobType::PipelineEncode => {
                    JobPayload::PipelineEncode { request_id: request.id, target: target.clone() }
                }
                JobType::PipelineDeliver => {
                    JobPayload::PipelineDeliver { request_id: request.id, target: target.clone() }
                }
                other => return Err(anyhow!("ensure_target_jobs called with unsupported job type {other}")),
            };
            self.queue.add_if_not_exists(job_type, &payload, &dedupe, opts).await?;
        }
        Ok(())
    }

    /// `true` once one sub-job per target exists and every one of them has
    /// reached a terminal status (Completed, Failed, or Cancelled) — the
    /// "all targets have either succeeded or exhausted retries" condition
    /// from spec.md §4.6.
    async fn all_targets_terminal(&self, request: &RequestRecord, job_type: JobType) -> Result<bool> {
        let targets: Vec<DeliveryTarget> = serde_json::from_value(request.targets.clone())?;
        let jobs = self.db.jobs().list_for_request(request.id, job_type).await?;
        if jobs.len() < targets.len() {
            return Ok(false);
        }
        Ok(jobs.iter().all(|j| j.status.is_terminal()))
    }

    /// The `pipeline:execute-step` dispatcher body (spec.md §4.6 "Step
    /// advancement"). Re-running this against an unchanged request is a
    /// no-op: every concrete enqueue is deduped, and a status with nothing
    /// left to do falls through the match doing nothing.
    pub async fn dispatch_step(&self, request_id: Uuid) -> Result<()> {
        let Some(request) = self.db.requests().get(request_id).await? else {
            return Ok(());
        };

        match request.kind {
            MediaKind::Movie => self.dispatch_movie_step(&request).await,
            MediaKind::Series => self.dispatch_series_step(&request).await,
        }
    }

    async fn dispatch_movie_step(&self, request: &RequestRecord) -> Result<()> {
        match request.status {
            RequestStatus::New => {
                self.db.requests().set_status(request.id, RequestStatus::Searching, "searching").await?;
                self.enqueue_search(request.id).await?;
            }
            RequestStatus::Downloading => {
                self.enqueue_download(request.id).await?;
            }
            RequestStatus::Encoding => {
                if self.all_targets_terminal(request, JobType::PipelineEncode).await? {
                    let updated = self
                        .db
                        .requests()
                        .set_status(request.id, RequestStatus::Delivering, "delivering")
                        .await?;
                    self.ensure_target_jobs(&updated, JobType::PipelineDeliver).await?;
                } else {
                    self.ensure_target_jobs(request, JobType::PipelineEncode).await?;
                }
            }
            RequestStatus::Delivering => {
                if self.all_targets_terminal(request, JobType::PipelineDeliver).await? {
                    let jobs = self.db.jobs().list_for_request(request.id, JobType::PipelineDeliver).await?;
                    // spec.md §7: partial delivery failures surface per-target,
                    // not as a request-level failure — only a request where
                    // every target job failed/cancelled (none completed) is
                    // itself Failed.
                    if jobs.iter().all(|j| j.status != crate::db::jobs::JobStatus::Completed) {
                        self.db
                            .requests()
                            .set_status(request.id, RequestStatus::Failed, "all delivery targets failed")
                            .await?;
                    } else {
                        self.db.requests().set_status(request.id, RequestStatus::Complete, "complete").await?;
                    }
                } else {
                    self.ensure_target_jobs(request, JobType::PipelineDeliver).await?;
                }
            }
            // Searching/Awaiting/QualityUnavailable/PendingApproval are each
            // advanced by their own handler, the retry-awaiting task, or an
            // approval decision — not by the dispatcher.
            RequestStatus::Searching
            | RequestStatus::Awaiting
            | RequestStatus::QualityUnavailable
            | RequestStatus::PendingApproval
            | RequestStatus::Complete
            | RequestStatus::Failed
            | RequestStatus::Cancelled => {}
        }
        Ok(())
    }

    async fn dispatch_series_step(&self, request: &RequestRecord) -> Result<()> {
        match request.status {
            RequestStatus::New => {
                self.db.requests().set_status(request.id, RequestStatus::Searching, "searching").await?;
                let opts = AddJobOptions { request_id: Some(request.id), ..AddJobOptions::new() };
                self.queue
                    .add_if_not_exists(
                        JobType::TvSearch,
                        &JobPayload::TvSearch { request_id: request.id },
                        &format!("tv:search:{}", request.id),
                        opts,
                    )
                    .await?;
            }
            _ => self.sync_request_status_from_items(request.id).await?,
        }
        Ok(())
    }

    /// Rolls the per-episode ProcessingItem states up into the parent
    /// Request's fan-out status (spec.md §4.6 "State machine (Series)").
    async fn sync_request_status_from_items(&self, request_id: Uuid) -> Result<()> {
        let items = self.db.processing_items().list_for_request(request_id).await?;
        if items.is_empty() {
            return Ok(());
        }

        let any = |status: RequestStatus| items.iter().any(|i| i.status == status);
        let all_in = |statuses: &[RequestStatus]| items.iter().all(|i| statuses.contains(&i.status));

        let next = if all_in(&[RequestStatus::Complete]) {
            RequestStatus::Complete
        } else if any(RequestStatus::Delivering)
            || all_in(&[RequestStatus::Delivering, RequestStatus::Complete, RequestStatus::Failed])
        {
            RequestStatus::Delivering
        } else if any(RequestStatus::Encoding)
            || all_in(&[
                RequestStatus::Encoding,
                RequestStatus::Delivering,
                RequestStatus::Complete,
                RequestStatus::Failed,
            ])
        {
            RequestStatus::Encoding
        } else if any(RequestStatus::Downloading) {
            RequestStatus::Downloading
        } else if any(RequestStatus::New) {
            RequestStatus::Searching
        } else if all_in(&[RequestStatus::QualityUnavailable, RequestStatus::Awaiting]) {
            RequestStatus::QualityUnavailable
        } else if all_in(&[RequestStatus::Awaiting]) {
            RequestStatus::Awaiting
        } else {
            return Ok(());
        };

        self.db.requests().set_status(request_id, next, &format!("{next:?}").to_lowercase()).await?;
        Ok(())
    }

    async fn run_search(&self, ctx: &JobContext, request_id: Uuid) -> Result<serde_json::Value> {
        let request = self
            .db
            .requests()
            .get(request_id)
            .await?
            .ok_or_else(|| anyhow!("request {request_id} not found"))?;

        let query = IndexerQuery {
            kind: Some(to_indexer_kind(request.kind)),
            external_ids: request.external_id.clone().into_iter().collect(),
            query: request.title.clone(),
            year: request.year,
            season: None,
            episode: None,
        };

        let found = self.fanout.search(&query).await;
        ctx.update_progress(1, 2).await;

        let required_resolution = request.required_resolution.as_deref().and_then(parse_resolution);
        let constraints = SelectionConstraints { required_resolution, ..Default::default() };
        let result = select(&found.releases, &constraints);

        match &result.winner {
            Some(winner) => {
                let selected = serde_json::to_value(winner)?;
                let available = serde_json::to_value(&result.releases)?;
                self.db.requests().set_selected_release(request_id, Some(selected), Some(available)).await?;

                if self.approval_required().await? {
                    let timeout_hours = self.approval_timeout_hours().await?;
                    self.db
                        .requests()
                        .set_status(request_id, RequestStatus::PendingApproval, "awaiting approval")
                        .await?;
                    self.db
                        .approvals()
                        .create(CreateApproval {
                            request_id,
                            step_order: 1,
                            reason: format!("release selected: {}", winner.title),
                            required_role: None,
                            timeout_hours: Some(timeout_hours),
                            auto_action: AutoAction::Approve,
                        })
                        .await?;
                } else {
                    self.db.requests().set_status(request_id, RequestStatus::Downloading, "downloading").await?;
                    self.enqueue_download(request_id).await?;
                }
            }
            None if !result.raw.is_empty() => {
                let raw = serde_json::to_value(&result.raw)?;
                self.db.requests().set_selected_release(request_id, None, Some(raw)).await?;
                self.db
                    .requests()
                    .set_status(request_id, RequestStatus::QualityUnavailable, "quality unavailable")
                    .await?;
            }
            None => {
                self.db.requests().set_status(request_id, RequestStatus::Awaiting, "awaiting candidates").await?;
            }
        }

        ctx.update_progress(2, 2).await;
        Ok(json!({"releasesFound": found.releases.len(), "errors": found.errors}))
    }

    async fn run_download(&self, ctx: &JobContext, request_id: Uuid) -> Result<serde_json::Value, HandlerError> {
        let request = self
            .db
            .requests()
            .get(request_id)
            .await
            .map_err(HandlerError::Transient)?
            .ok_or_else(|| HandlerError::Permanent(anyhow!("request {request_id} not found")))?;

        let release: Release = match &request.selected_release {
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| HandlerError::Permanent(anyhow!("malformed selected_release: {e}")))?,
            None => return Err(HandlerError::Permanent(anyhow!("request has no selected release"))),
        };

        let source = release_source(&release).map_err(HandlerError::Permanent)?;
        let client_hash = self
            .download_client
            .add(source, AddDownloadOptions::default())
            .await
            .map_err(HandlerError::Transient)?;

        loop {
            if ctx.is_cancelled().await {
                return Err(HandlerError::Permanent(anyhow!("download cancelled")));
            }

            let progress = self
                .download_client
                .get_progress(&client_hash)
                .await
                .map_err(HandlerError::Transient)?;

            ctx.update_progress(progress.downloaded_bytes, progress.total_bytes.max(1)).await;

            if progress.is_complete {
                break;
            }
            if progress.state == DownloadState::Error {
                self.report_failure(request_id, "download client reported a terminal error")
                    .await
                    .map_err(HandlerError::Transient)?;
                return Err(HandlerError::Permanent(anyhow!("download failed")));
            }

            tokio::time::sleep(DOWNLOAD_POLL_INTERVAL).await;
        }

        self.download_client
            .get_main_video_file(&client_hash)
            .await
            .map_err(HandlerError::Transient)?;

        self.db
            .requests()
            .set_status(request_id, RequestStatus::Encoding, "encoding")
            .await
            .map_err(HandlerError::Transient)?;
        self.enqueue_execute_step(request_id).await.map_err(HandlerError::Transient)?;

        Ok(json!({"clientHash": client_hash}))
    }

    async fn run_encode(&self, ctx: &JobContext, request_id: Uuid, target: &DeliveryTarget) -> Result<serde_json::Value, HandlerError> {
        // Actual video transcoding is a downstream, CPU-heavy engine out of
        // scope for this core (spec.md §5); this stage only tracks
        // per-target completion so DELIVER can fan out once every target
        // has finished.
        ctx.update_progress(1, 1).await;
        self.enqueue_execute_step(request_id).await.map_err(HandlerError::Transient)?;
        Ok(json!({"serverId": target.server_id}))
    }

    async fn run_deliver(&self, ctx: &JobContext, request_id: Uuid, target: &DeliveryTarget) -> Result<serde_json::Value, HandlerError> {
        self.media_server
            .trigger_scan(&target.server_id, "")
            .await
            .map_err(HandlerError::Transient)?;
        ctx.update_progress(1, 1).await;
        self.enqueue_execute_step(request_id).await.map_err(HandlerError::Transient)?;
        Ok(json!({"serverId": target.server_id}))
    }

    async fn run_retry_awaiting(&self) -> Result<serde_json::Value> {
        let hours = self.search_retry_interval_hours().await?;
        let due = self.db.requests().due_for_retry(hours).await?;
        for request in &due {
            self.db.requests().set_status(request.id, RequestStatus::Searching, "retrying search").await?;
            self.enqueue_search(request.id).await?;
        }
        Ok(json!({"retried": due.len()}))
    }

    async fn run_tv_search(&self, request_id: Uuid) -> Result<serde_json::Value> {
        let request = self
            .db
            .requests()
            .get(request_id)
            .await?
            .ok_or_else(|| anyhow!("request {request_id} not found"))?;

        let items = self.db.processing_items().list_for_request(request_id).await?;
        let pending: Vec<ProcessingItemRecord> =
            items.into_iter().filter(|i| i.status == RequestStatus::New).collect();

        let required_resolution = request.required_resolution.as_deref().and_then(parse_resolution);
        let constraints = SelectionConstraints { required_resolution, ..Default::default() };

        let mut by_season: std::collections::BTreeMap<i32, (Option<ProcessingItemRecord>, Vec<ProcessingItemRecord>)> =
            std::collections::BTreeMap::new();
        for item in pending {
            let entry = by_season.entry(item.season).or_default();
            if item.episode.is_none() {
                entry.0 = Some(item);
            } else {
                entry.1.push(item);
            }
        }

        let mut searched = 0;
        for (season, (season_pack, episodes)) in by_season {
            searched += episodes.len() + season_pack.is_some() as usize;

            let mut episode_results = Vec::with_capacity(episodes.len());
            for episode_item in episodes {
                let query = IndexerQuery {
                    kind: Some(IndexerMediaKind::Series),
                    external_ids: request.external_id.clone().into_iter().collect(),
                    query: request.title.clone(),
                    year: request.year,
                    season: Some(season),
                    episode: episode_item.episode,
                };
                let found = self.fanout.search(&query).await;
                let result = select(&found.releases, &constraints);
                episode_results.push((episode_item, result));
            }

            let best_episode_score = episode_results
                .iter()
                .filter_map(|(_, result)| result.winner.as_ref().map(|w| w.score))
                .max();

            let Some(season_pack_item) = season_pack else {
                for (episode_item, result) in episode_results {
                    self.commit_tv_selection(request_id, &episode_item, result).await?;
                }
                continue;
            };

            let query = IndexerQuery {
                kind: Some(IndexerMediaKind::Series),
                external_ids: request.external_id.clone().into_iter().collect(),
                query: request.title.clone(),
                year: request.year,
                season: Some(season),
                episode: None,
            };
            let found = self.fanout.search(&query).await;
            let pack_result = select(&found.releases, &constraints);

            // Season-pack preference (spec.md §9 Open Question): a pack wins
            // only when it satisfies every episode unit of this season (i.e.
            // there are no per-episode alternatives it would leave behind, or
            // its score matches/beats the best one) and scores at least as
            // well as the best per-episode winner.
            let prefer_pack = match (&pack_result.winner, best_episode_score) {
                (Some(winner), Some(best)) => winner.score >= best,
                (Some(_), None) => true,
                (None, _) => false,
            };

            if prefer_pack {
                let winner = pack_result.winner.clone().expect("checked above");
                self.commit_tv_selection(request_id, &season_pack_item, pack_result).await?;
                for (episode_item, _) in episode_results {
                    // The pack download satisfies these episodes too (spec.md
                    // §3 season-pack invariant); they move straight to
                    // Downloading without their own download job.
                    let selected = serde_json::to_value(&winner)?;
                    self.db
                        .processing_items()
                        .set_selected_release(episode_item.id, Some(selected), None)
                        .await?;
                    self.db.processing_items().set_status(episode_item.id, RequestStatus::Downloading).await?;
                }
            } else {
                self.commit_tv_selection(request_id, &season_pack_item, pack_result).await?;
                for (episode_item, result) in episode_results {
                    self.commit_tv_selection(request_id, &episode_item, result).await?;
                }
            }
        }

        self.sync_request_status_from_items(request_id).await?;
        Ok(json!({"itemsSearched": searched}))
    }

    /// Commits a single ProcessingItem's search outcome: Downloading +
    /// download-job enqueue on a winner, QualityUnavailable if constraints
    /// filtered everything out, Awaiting if the indexers found nothing at all.
    async fn commit_tv_selection(
        &self,
        request_id: Uuid,
        item: &ProcessingItemRecord,
        result: crate::services::quality::SelectionResult,
    ) -> Result<()> {
        match result.winner {
            Some(winner) => {
                let selected = serde_json::to_value(&winner)?;
                let available = serde_json::to_value(&result.releases)?;
                self.db
                    .processing_items()
                    .set_selected_release(item.id, Some(selected), Some(available))
                    .await?;
                self.db.processing_items().set_status(item.id, RequestStatus::Downloading).await?;

                let opts = AddJobOptions { request_id: Some(request_id), ..AddJobOptions::new() };
                if item.episode.is_none() {
                    self.queue
                        .add_if_not_exists(
                            JobType::TvDownloadSeason,
                            &JobPayload::TvDownloadSeason { request_id, season: item.season },
                            &format!("tv:download-season:{request_id}:{}", item.season),
                            opts,
                        )
                        .await?;
                } else {
                    self.queue
                        .add_if_not_exists(
                            JobType::TvDownloadEpisode,
                            &JobPayload::TvDownloadEpisode { request_id, processing_item_id: item.id },
                            &format!("tv:download-episode:{}", item.id),
                            opts,
                        )
                        .await?;
                }
            }
            None if !result.raw.is_empty() => {
                let raw = serde_json::to_value(&result.raw)?;
                self.db.processing_items().set_selected_release(item.id, None, Some(raw)).await?;
                self.db.processing_items().set_status(item.id, RequestStatus::QualityUnavailable).await?;
            }
            None => {
                self.db.processing_items().set_status(item.id, RequestStatus::Awaiting).await?;
            }
        }
        Ok(())
    }

    async fn run_tv_download_episode(
        &self,
        ctx: &JobContext,
        request_id: Uuid,
        processing_item_id: Uuid,
    ) -> Result<serde_json::Value, HandlerError> {
        let items = self
            .db
            .processing_items()
            .list_for_request(request_id)
            .await
            .map_err(HandlerError::Transient)?;
        let item = items
            .into_iter()
            .find(|i| i.id == processing_item_id)
            .ok_or_else(|| HandlerError::Permanent(anyhow!("processing item {processing_item_id} not found")))?;

        let release: Release = match &item.selected_release {
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| HandlerError::Permanent(anyhow!("malformed selected_release: {e}")))?,
            None => return Err(HandlerError::Permanent(anyhow!("processing item has no selected release"))),
        };

        let client_hash = self
            .download_client
            .add(release_source(&release).map_err(HandlerError::Permanent)?, AddDownloadOptions::default())
            .await
            .map_err(HandlerError::Transient)?;

        loop {
            if ctx.is_cancelled().await {
                return Err(HandlerError::Permanent(anyhow!("download cancelled")));
            }
            let progress = self
                .download_client
                .get_progress(&client_hash)
                .await
                .map_err(HandlerError::Transient)?;
            ctx.update_progress(progress.downloaded_bytes, progress.total_bytes.max(1)).await;
            if progress.is_complete {
                break;
            }
            if progress.state == DownloadState::Error {
                return Err(HandlerError::Permanent(anyhow!("download failed")));
            }
            tokio::time::sleep(DOWNLOAD_POLL_INTERVAL).await;
        }

        self.db
            .processing_items()
            .set_status(processing_item_id, RequestStatus::Encoding)
            .await
            .map_err(HandlerError::Transient)?;
        self.sync_request_status_from_items(request_id).await.map_err(HandlerError::Transient)?;
        self.enqueue_execute_step(request_id).await.map_err(HandlerError::Transient)?;

        Ok(json!({"clientHash": client_hash}))
    }

    async fn run_tv_download_season(
        &self,
        ctx: &JobContext,
        request_id: Uuid,
        season: i32,
    ) -> Result<serde_json::Value, HandlerError> {
        let items = self
            .db
            .processing_items()
            .list_for_request(request_id)
            .await
            .map_err(HandlerError::Transient)?;
        let pack = items
            .into_iter()
            .find(|i| i.season == season && i.episode.is_none())
            .ok_or_else(|| HandlerError::Permanent(anyhow!("no season-pack item for season {season}")))?;

        let release: Release = match &pack.selected_release {
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| HandlerError::Permanent(anyhow!("malformed selected_release: {e}")))?,
            None => return Err(HandlerError::Permanent(anyhow!("season pack has no selected release"))),
        };

        let client_hash = self
            .download_client
            .add(release_source(&release).map_err(HandlerError::Permanent)?, AddDownloadOptions::default())
            .await
            .map_err(HandlerError::Transient)?;

        loop {
            if ctx.is_cancelled().await {
                return Err(HandlerError::Permanent(anyhow!("download cancelled")));
            }
            let progress = self
                .download_client
                .get_progress(&client_hash)
                .await
                .map_err(HandlerError::Transient)?;
            ctx.update_progress(progress.downloaded_bytes, progress.total_bytes.max(1)).await;
            if progress.is_complete {
                break;
            }
            if progress.state == DownloadState::Error {
                return Err(HandlerError::Permanent(anyhow!("season pack download failed")));
            }
            tokio::time::sleep(DOWNLOAD_POLL_INTERVAL).await;
        }

        // Season-pack invariant (spec.md §3): the pack item and every
        // still-Awaiting episode item in the same season move together.
        self.db
            .processing_items()
            .set_status(pack.id, RequestStatus::Encoding)
            .await
            .map_err(HandlerError::Transient)?;
        self.db
            .processing_items()
            .set_status_for_season(request_id, season, RequestStatus::Encoding)
            .await
            .map_err(HandlerError::Transient)?;

        self.sync_request_status_from_items(request_id).await.map_err(HandlerError::Transient)?;
        self.enqueue_execute_step(request_id).await.map_err(HandlerError::Transient)?;

        Ok(json!({"clientHash": client_hash, "season": season}))
    }

    async fn report_failure(&self, request_id: Uuid, error: &str) -> Result<()> {
        warn!(request_id = %request_id, error, "request failed");
        self.db
            .requests()
            .set_status(request_id, RequestStatus::Failed, &format!("failed: {error}"))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ExecutorHandle for PipelineExecutor {
    async fn advance(&self, request_id: Uuid) -> Result<()> {
        self.enqueue_execute_step(request_id).await
    }

    async fn report_failure(&self, request_id: Uuid, error: &str) -> Result<()> {
        PipelineExecutor::report_failure(self, request_id, error).await
    }
}

pub struct ExecuteStepHandler {
    pub executor: Arc<PipelineExecutor>,
}

#[async_trait]
impl JobHandler for ExecuteStepHandler {
    async fn handle(&self, ctx: JobContext, payload: JobPayload) -> Result<serde_json::Value, HandlerError> {
        let JobPayload::PipelineExecuteStep { request_id } = payload else {
            return Err(HandlerError::Permanent(anyhow!("expected pipeline:execute-step payload")));
        };
        self.executor.dispatch_step(request_id).await.map_err(HandlerError::Transient)?;
        ctx.update_progress(1, 1).await;
        Ok(json!({"requestId": request_id}))
    }
}

pub struct SearchHandler {
    pub executor: Arc<PipelineExecutor>,
}

#[async_trait]
impl JobHandler for SearchHandler {
    async fn handle(&self, ctx: JobContext, payload: JobPayload) -> Result<serde_json::Value, HandlerError> {
        let JobPayload::PipelineSearch { request_id } = payload else {
            return Err(HandlerError::Permanent(anyhow!("expected pipeline:search payload")));
        };
        self.executor.run_search(&ctx, request_id).await.map_err(HandlerError::Transient)
    }
}

pub struct DownloadHandler {
    pub executor: Arc<PipelineExecutor>,
}

#[async_trait]
impl JobHandler for DownloadHandler {
    async fn handle(&self, ctx: JobContext, payload: JobPayload) -> Result<serde_json::Value, HandlerError> {
        let JobPayload::PipelineDownload { request_id } = payload else {
            return Err(HandlerError::Permanent(anyhow!("expected pipeline:download payload")));
        };
        self.executor.run_download(&ctx, request_id).await
    }
}

pub struct EncodeHandler {
    pub executor: Arc<PipelineExecutor>,
}

#[async_trait]
impl JobHandler for EncodeHandler {
    async fn handle(&self, ctx: JobContext, payload: JobPayload) -> Result<serde_json::Value, HandlerError> {
        let JobPayload::PipelineEncode { request_id, target } = payload else {
            return Err(HandlerError::Permanent(anyhow!("expected pipeline:encode payload")));
        };
        self.executor.run_encode(&ctx, request_id, &target).await
    }
}

pub struct DeliverHandler {
    pub executor: Arc<PipelineExecutor>,
}

#[async_trait]
impl JobHandler for DeliverHandler {
    async fn handle(&self, ctx: JobContext, payload: JobPayload) -> Result<serde_json::Value, HandlerError> {
        let JobPayload::PipelineDeliver { request_id, target } = payload else {
            return Err(HandlerError::Permanent(anyhow!("expected pipeline:deliver payload")));
        };
        self.executor.run_deliver(&ctx, request_id, &target).await
    }
}

pub struct RetryAwaitingHandler {
    pub executor: Arc<PipelineExecutor>,
}

#[async_trait]
impl JobHandler for RetryAwaitingHandler {
    async fn handle(&self, _ctx: JobContext, payload: JobPayload) -> Result<serde_json::Value, HandlerError> {
        if !matches!(payload, JobPayload::PipelineRetryAwaiting) {
            return Err(HandlerError::Permanent(anyhow!("expected pipeline:retry-awaiting payload")));
        }
        self.executor.run_retry_awaiting().await.map_err(HandlerError::Transient)
    }
}

pub struct TvSearchHandler {
    pub executor: Arc<PipelineExecutor>,
}

#[async_trait]
impl JobHandler for TvSearchHandler {
    async fn handle(&self, _ctx: JobContext, payload: JobPayload) -> Result<serde_json::Value, HandlerError> {
        let JobPayload::TvSearch { request_id } = payload else {
            return Err(HandlerError::Permanent(anyhow!("expected tv:search payload")));
        };
        self.executor.run_tv_search(request_id).await.map_err(HandlerError::Transient)
    }
}

pub struct TvDownloadEpisodeHandler {
    pub executor: Arc<PipelineExecutor>,
}

#[async_trait]
impl JobHandler for TvDownloadEpisodeHandler {
    async fn handle(&self, ctx: JobContext, payload: JobPayload) -> Result<serde_json::Value, HandlerError> {
        let JobPayload::TvDownloadEpisode { request_id, processing_item_id } = payload else {
            return Err(HandlerError::Permanent(anyhow!("expected tv:download-episode payload")));
        };
        self.executor.run_tv_download_episode(&ctx, request_id, processing_item_id).await
    }
}

pub struct TvDownloadSeasonHandler {
    pub executor: Arc<PipelineExecutor>,
}

#[async_trait]
impl JobHandler for TvDownloadSeasonHandler {
    async fn handle(&self, ctx: JobContext, payload: JobPayload) -> Result<serde_json::Value, HandlerError> {
        let JobPayload::TvDownloadSeason { request_id, season } = payload else {
            return Err(HandlerError::Permanent(anyhow!("expected tv:download-season payload")));
        };
        self.executor.run_tv_download_season(&ctx, request_id, season).await
    }
}

/// No metadata-provider contract is defined in spec.md §6 to discover newly
/// aired episodes for an ongoing series (only Indexer, DownloadClient, and
/// MediaServerAdapter are named external collaborators), so this handler is
/// a documented no-op until such an adapter is introduced.
pub struct TvCheckNewEpisodesHandler;

#[async_trait]
impl JobHandler for TvCheckNewEpisodesHandler {
    async fn handle(&self, _ctx: JobContext, payload: JobPayload) -> Result<serde_json::Value, HandlerError> {
        let JobPayload::TvCheckNewEpisodes { request_id } = payload else {
            return Err(HandlerError::Permanent(anyhow!("expected tv:check-new-episodes payload")));
        };
        info!(request_id = %request_id, "tv:check-new-episodes has no metadata provider configured, skipping");
        Ok(json!({"requestId": request_id, "newEpisodes": 0}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::requests::CreateRequest;
    use crate::events::job_event_channel;
    use crate::services::download::{DownloadProgress, MainVideoFile};
    use crate::services::indexer::{Indexer as IndexerTrait, IndexerQuery as Query};
    use crate::services::media_server::{FetchLibraryOptions, LibraryItem};
    use crate::services::quality::{Codec, Source};
    use chrono::Utc;
    use sqlx::PgPool;

    fn release(title: &str, resolution: Resolution, source: Source, seeders: i64) -> Release {
        Release {
            title: title.to_string(),
            indexer_id: Uuid::nil(),
            indexer_name: "mock".to_string(),
            resolution,
            source,
            codec: Codec::H264,
            size_bytes: 1_000_000_000,
            seeders,
            leechers: 0,
            download_url: Some("https://example.test/dl".to_string()),
            magnet_uri: None,
            publish_date: Utc::now(),
            categories: vec![],
            score: 0,
        }
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

    struct MockDownloadClient;

    #[async_trait]
    impl DownloadClient for MockDownloadClient {
        async fn add(&self, _source: DownloadSource, _opts: AddDownloadOptions) -> anyhow::Result<String> {
            Ok("hash-1".to_string())
        }
        async fn get_progress(&self, _client_hash: &str) -> anyhow::Result<DownloadProgress> {
            Ok(DownloadProgress {
                state: DownloadState::Complete,
                progress_pct: 100.0,
                downloaded_bytes: 100,
                total_bytes: 100,
                eta_seconds: Some(0),
                speed_bytes_per_sec: Some(0),
                is_complete: true,
            })
        }
        async fn get_main_video_file(&self, _client_hash: &str) -> anyhow::Result<MainVideoFile> {
            Ok(MainVideoFile { path: "/tmp/movie.mkv".to_string(), size_bytes: 100 })
        }
        async fn pause(&self, _client_hash: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn resume(&self, _client_hash: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn delete(&self, _client_hash: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct MockMediaServer;

    #[async_trait]
    impl MediaServerAdapter for MockMediaServer {
        async fn fetch_library(
            &self,
            _server_url: &str,
            _api_key: &str,
            _opts: FetchLibraryOptions,
        ) -> anyhow::Result<Vec<LibraryItem>> {
            Ok(vec![])
        }
        async fn trigger_scan(&self, _server_url: &str, _api_key: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Builds a `PipelineExecutor` over the given indexer plus mock
    /// download/media-server adapters, wired the same way `app.rs` wires
    /// the real ones.
    fn build_executor(db: Database, indexer: Arc<dyn IndexerTrait>) -> Arc<PipelineExecutor> {
        let queue = Arc::new(JobQueue::new(db.clone(), Arc::new(NullExecutor), "test-worker".to_string(), 3));
        let fanout = Arc::new(IndexerFanout::new(vec![indexer]));
        Arc::new(PipelineExecutor::new(db, queue, fanout, Arc::new(MockDownloadClient), Arc::new(MockMediaServer)))
    }

    fn test_ctx(db: Database, job_type: JobType) -> JobContext {
        let (events, _rx) = job_event_channel();
        JobContext { db, events, executor: Arc::new(NullExecutor), job_id: Uuid::new_v4(), job_type, request_id: None }
    }

    struct FixedIndexer {
        releases: Vec<Release>,
    }

    #[async_trait]
    impl IndexerTrait for FixedIndexer {
        fn id(&self) -> Uuid {
            Uuid::nil()
        }
        fn name(&self) -> &str {
            "fixed"
        }
        fn can_handle_query(&self, _query: &Query) -> bool {
            true
        }
        async fn search(&self, _query: &Query) -> anyhow::Result<Vec<Release>> {
            Ok(self.releases.clone())
        }
    }

    #[sqlx::test]
    async fn s1_movie_happy_path_selects_highest_scoring_release(pool: PgPool) -> anyhow::Result<()> {
        let db = Database::from_pool(pool);
        let indexer = Arc::new(FixedIndexer {
            releases: vec![
                release("Dune.2021.1080p.WEB-DL.H264", Resolution::P1080, Source::WebDL, 120),
                release("Dune.2021.2160p.BluRay.HEVC", Resolution::P2160, Source::BluRay, 40),
                release("Dune.2021.720p.HDTV.H264", Resolution::P720, Source::Hdtv, 5),
            ],
        });
        let executor = build_executor(db.clone(), indexer);

        let request = db
            .requests()
            .create(CreateRequest {
                external_id: Some("tmdb:438631".to_string()),
                kind: MediaKind::Movie,
                title: "Dune".to_string(),
                year: Some(2021),
                targets: vec![DeliveryTarget { server_id: "srv1".to_string(), encoding_profile_id: None }],
                required_resolution: None,
                series_items: vec![],
            })
            .await?;

        let ctx = test_ctx(db.clone(), JobType::PipelineSearch);
        executor.run_search(&ctx, request.id).await?;

        let updated = db.requests().get(request.id).await?.unwrap();
        assert_eq!(updated.status, RequestStatus::Downloading);
        let selected: Release = serde_json::from_value(updated.selected_release.unwrap())?;
        assert_eq!(selected.resolution, Resolution::P2160);
        Ok(())
    }

    #[sqlx::test]
    async fn s2_quality_gate_blocks_below_required_resolution(pool: PgPool) -> anyhow::Result<()> {
        let db = Database::from_pool(pool);
        let indexer = Arc::new(FixedIndexer {
            releases: vec![release("Dune.2021.720p.HDTV.H264", Resolution::P720, Source::Hdtv, 5)],
        });
        let executor = build_executor(db.clone(), indexer);

        let request = db
            .requests()
            .create(CreateRequest {
                external_id: Some("tmdb:438631".to_string()),
                kind: MediaKind::Movie,
                title: "Dune".to_string(),
                year: Some(2021),
                targets: vec![DeliveryTarget { server_id: "srv1".to_string(), encoding_profile_id: None }],
                required_resolution: Some("1080p".to_string()),
                series_items: vec![],
            })
            .await?;

        let ctx = test_ctx(db.clone(), JobType::PipelineSearch);
        executor.run_search(&ctx, request.id).await?;

        let updated = db.requests().get(request.id).await?.unwrap();
        assert_eq!(updated.status, RequestStatus::QualityUnavailable);
        assert!(updated.selected_release.is_none());
        let available: Vec<Release> = serde_json::from_value(updated.available_releases.unwrap())?;
        assert_eq!(available.len(), 1, "the filtered-out release is still recorded for operator visibility");
        Ok(())
    }

    struct SeasonAwareIndexer {
        pack: Vec<Release>,
        episode: Vec<Release>,
    }

    #[async_trait]
    impl IndexerTrait for SeasonAwareIndexer {
        fn id(&self) -> Uuid {
            Uuid::nil()
        }
        fn name(&self) -> &str {
            "season-aware"
        }
        fn can_handle_query(&self, _query: &Query) -> bool {
            true
        }
        async fn search(&self, query: &Query) -> anyhow::Result<Vec<Release>> {
            Ok(if query.episode.is_none() { self.pack.clone() } else { self.episode.clone() })
        }
    }

    #[sqlx::test]
    async fn season_pack_wins_when_it_outscores_the_best_episode(pool: PgPool) -> anyhow::Result<()> {
        let db = Database::from_pool(pool);
        let indexer = Arc::new(SeasonAwareIndexer {
            pack: vec![release("Show.S01.2160p.BluRay.HEVC", Resolution::P2160, Source::BluRay, 100)],
            episode: vec![release("Show.S01E01.1080p.WEB-DL.H264", Resolution::P1080, Source::WebDL, 50)],
        });
        let executor = build_executor(db.clone(), indexer);

        let request = db
            .requests()
            .create(CreateRequest {
                external_id: Some("tvdb:1".to_string()),
                kind: MediaKind::Series,
                title: "Show".to_string(),
                year: None,
                targets: vec![DeliveryTarget { server_id: "srv1".to_string(), encoding_profile_id: None }],
                required_resolution: None,
                series_items: vec![(1, Some(1)), (1, Some(2)), (1, None)],
            })
            .await?;

        executor.run_tv_search(request.id).await?;

        let items = db.processing_items().list_for_request(request.id).await?;
        assert_eq!(items.len(), 3);
        for item in &items {
            assert_eq!(item.status, RequestStatus::Downloading, "season: {} episode: {:?}", item.season, item.episode);
            let selected: Release = serde_json::from_value(item.selected_release.clone().unwrap())?;
            assert_eq!(selected.resolution, Resolution::P2160, "every unit should carry the pack's release");
        }
        Ok(())
    }

    #[sqlx::test]
    async fn per_episode_releases_win_when_the_pack_scores_lower(pool: PgPool) -> anyhow::Result<()> {
        let db = Database::from_pool(pool);
        let indexer = Arc::new(SeasonAwareIndexer {
            pack: vec![release("Show.S01.480p.WEBRip.H264", Resolution::P480, Source::WebRip, 1)],
            episode: vec![release("Show.S01E01.2160p.BluRay.HEVC", Resolution::P2160, Source::BluRay, 100)],
        });
        let executor = build_executor(db.clone(), indexer);

        let request = db
            .requests()
            .create(CreateRequest {
                external_id: Some("tvdb:2".to_string()),
                kind: MediaKind::Series,
                title: "Show".to_string(),
                year: None,
                targets: vec![DeliveryTarget { server_id: "srv1".to_string(), encoding_profile_id: None }],
                required_resolution: None,
                series_items: vec![(1, Some(1)), (1, None)],
            })
            .await?;

        executor.run_tv_search(request.id).await?;

        let items = db.processing_items().list_for_request(request.id).await?;
        let episode_item = items.iter().find(|i| i.episode == Some(1)).unwrap();
        let pack_item = items.iter().find(|i| i.episode.is_none()).unwrap();

        assert_eq!(episode_item.status, RequestStatus::Downloading);
        let episode_release: Release = serde_json::from_value(episode_item.selected_release.clone().unwrap())?;
        assert_eq!(episode_release.resolution, Resolution::P2160);

        assert_eq!(pack_item.status, RequestStatus::Downloading);
        let pack_release: Release = serde_json::from_value(pack_item.selected_release.clone().unwrap())?;
        assert_eq!(pack_release.resolution, Resolution::P480, "the pack keeps its own (losing) release, not the episode's");
        Ok(())
    }

    #[sqlx::test]
    async fn movie_download_stage_advances_to_encoding_on_completion(pool: PgPool) -> anyhow::Result<()> {
        let db = Database::from_pool(pool);
        let indexer = Arc::new(FixedIndexer { releases: vec![] });
        let executor = build_executor(db.clone(), indexer);

        let request = db
            .requests()
            .create(CreateRequest {
                external_id: None,
                kind: MediaKind::Movie,
                title: "Dune".to_string(),
                year: Some(2021),
                targets: vec![DeliveryTarget { server_id: "srv1".to_string(), encoding_profile_id: None }],
                required_resolution: None,
                series_items: vec![],
            })
            .await?;
        let selected = release("Dune.2021.2160p.BluRay.HEVC", Resolution::P2160, Source::BluRay, 40);
        db.requests()
            .set_selected_release(request.id, Some(serde_json::to_value(&selected)?), None)
            .await?;

        let ctx = test_ctx(db.clone(), JobType::PipelineDownload);
        executor.run_download(&ctx, request.id).await.map_err(|e| anyhow!("{e}"))?;

        let updated = db.requests().get(request.id).await?.unwrap();
        assert_eq!(updated.status, RequestStatus::Encoding);
        Ok(())
    }

    #[sqlx::test]
    async fn delivering_stage_fails_request_when_every_target_job_failed(pool: PgPool) -> anyhow::Result<()> {
        let db = Database::from_pool(pool);
        let indexer = Arc::new(FixedIndexer { releases: vec![] });
        let executor = build_executor(db.clone(), indexer);

        let target = DeliveryTarget { server_id: "srv1".to_string(), encoding_profile_id: None };
        let request = db
            .requests()
            .create(CreateRequest {
                external_id: None,
                kind: MediaKind::Movie,
                title: "Dune".to_string(),
                year: Some(2021),
                targets: vec![target.clone()],
                required_resolution: None,
                series_items: vec![],
            })
            .await?;
        db.requests().set_status(request.id, RequestStatus::Delivering, "delivering").await?;

        let job = db
            .jobs()
            .add(
                JobType::PipelineDeliver,
                serde_json::to_value(&JobPayload::PipelineDeliver { request_id: request.id, target })?,
                AddJobOptions { request_id: Some(request.id), ..AddJobOptions::new() },
            )
            .await?;
        db.jobs().mark_permanently_failed(job.id, "media server unreachable").await?;

        executor.dispatch_step(request.id).await?;

        let updated = db.requests().get(request.id).await?.unwrap();
        assert_eq!(updated.status, RequestStatus::Failed, "every delivery target failed, so the request fails too");
        Ok(())
    }

    #[sqlx::test]
    async fn delivering_stage_completes_when_at_least_one_target_succeeds(pool: PgPool) -> anyhow::Result<()> {
        let db = Database::from_pool(pool);
        let indexer = Arc::new(FixedIndexer { releases: vec![] });
        let executor = build_executor(db.clone(), indexer);

        let target_a = DeliveryTarget { server_id: "srv1".to_string(), encoding_profile_id: None };
        let target_b = DeliveryTarget { server_id: "srv2".to_string(), encoding_profile_id: None };
        let request = db
            .requests()
            .create(CreateRequest {
                external_id: None,
                kind: MediaKind::Movie,
                title: "Dune".to_string(),
                year: Some(2021),
                targets: vec![target_a.clone(), target_b.clone()],
                required_resolution: None,
                series_items: vec![],
            })
            .await?;
        db.requests().set_status(request.id, RequestStatus::Delivering, "delivering").await?;

        let failed_job = db
            .jobs()
            .add(
                JobType::PipelineDeliver,
                serde_json::to_value(&JobPayload::PipelineDeliver { request_id: request.id, target: target_a })?,
                AddJobOptions { request_id: Some(request.id), ..AddJobOptions::new() },
            )
            .await?;
        db.jobs().mark_permanently_failed(failed_job.id, "media server unreachable").await?;

        let completed_job = db
            .jobs()
            .add(
                JobType::PipelineDeliver,
                serde_json::to_value(&JobPayload::PipelineDeliver { request_id: request.id, target: target_b })?,
                AddJobOptions { request_id: Some(request.id), ..AddJobOptions::new() },
            )
            .await?;
        db.jobs().mark_completed(completed_job.id, serde_json::json!({})).await?;

        executor.dispatch_step(request.id).await?;

        let updated = db.requests().get(request.id).await?.unwrap();
        assert_eq!(updated.status, RequestStatus::Complete, "at least one target delivered, so the request completes");
        Ok(())
    }
}
