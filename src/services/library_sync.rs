//! Handlers for the three peripheral job types spec.md §4.3 lists alongside
//! the pipeline (`library:sync`, `library:sync-server`, `ratelimit:cleanup`)
//! but never details as their own `[MODULE]` — spec.md §1 scopes "library
//! sync (reconciliation with external media servers)" as context around
//! the pipeline, not a core component, and no MediaServer registry entity
//! is defined in spec.md §3 beyond the ad-hoc `DeliveryTarget.serverId`
//! string. These handlers stay real and DB-grounded where the existing data
//! model supports it and are documented no-ops where it doesn't.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::db::jobs::AddJobOptions;
use crate::db::Database;
use crate::error::HandlerError;
use crate::services::job_queue::{JobContext, JobHandler, JobPayload, JobQueue, JobType};
use crate::services::rate_limiter::RateLimiterRegistry;

/// Fans out a `library:sync-server` job per distinct `server_id` seen
/// across every Request's `targets` (spec.md §3 `DeliveryTarget`).
pub struct LibrarySyncHandler {
    pub db: Database,
    pub queue: Arc<JobQueue>,
}

#[async_trait]
impl JobHandler for LibrarySyncHandler {
    async fn handle(&self, _ctx: JobContext, payload: JobPayload) -> Result<serde_json::Value, HandlerError> {
        if !matches!(payload, JobPayload::LibrarySync) {
            return Err(HandlerError::Permanent(anyhow!("expected library:sync payload")));
        }

        let server_ids = self.db.requests().distinct_target_server_ids().await.map_err(HandlerError::Transient)?;

        for server_id in &server_ids {
            let opts = AddJobOptions::new();
            self.queue
                .add_if_not_exists(
                    JobType::LibrarySyncServer,
                    &JobPayload::LibrarySyncServer { server_id: server_id.clone() },
                    &format!("library:sync-server:{server_id}"),
                    opts,
                )
                .await
                .map_err(HandlerError::Transient)?;
        }

        Ok(json!({"serversQueued": server_ids.len()}))
    }
}

/// No MediaServer registry maps a `server_id` to a URL/API key in spec.md
/// §3/§6, so reconciliation itself is a documented no-op; it still records
/// a sync-state touch so the cursor row exists for when such a registry is
/// introduced.
pub struct LibrarySyncServerHandler {
    pub db: Database,
}

#[async_trait]
impl JobHandler for LibrarySyncServerHandler {
    async fn handle(&self, _ctx: JobContext, payload: JobPayload) -> Result<serde_json::Value, HandlerError> {
        let JobPayload::LibrarySyncServer { server_id } = payload else {
            return Err(HandlerError::Permanent(anyhow!("expected library:sync-server payload")));
        };

        info!(server_id = %server_id, "library:sync-server has no media-server registry configured, skipping");
        self.db
            .sync_state()
            .upsert(&format!("library:sync:{server_id}"), None, None, None, None)
            .await
            .map_err(HandlerError::Transient)?;

        Ok(json!({"serverId": server_id, "itemsSynced": 0}))
    }
}

/// Zeroes every named rate-limiter bucket's token count (spec.md §4.1's
/// `TokenBucket`), the self-maintenance task SPEC_FULL.md §4.2 names
/// alongside the Scheduler's task-summary logging.
pub struct RatelimitCleanupHandler {
    pub limiters: Arc<RateLimiterRegistry>,
    pub names: Vec<String>,
}

#[async_trait]
impl JobHandler for RatelimitCleanupHandler {
    async fn handle(&self, _ctx: JobContext, payload: JobPayload) -> Result<serde_json::Value, HandlerError> {
        if !matches!(payload, JobPayload::RatelimitCleanup) {
            return Err(HandlerError::Permanent(anyhow!("expected ratelimit:cleanup payload")));
        }

        for name in &self.names {
            self.limiters.zero_out(name);
        }

        Ok(json!({"bucketsCleared": self.names.len()}))
    }
}
