//! The Approval Gate (spec.md §4.8): creates Approval rows before a gated
//! stage, processes user decisions, and applies `autoAction` when a
//! cooldown expires.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::info;
use uuid::Uuid;

use crate::db::approvals::{ApprovalStatus, AutoAction, CreateApproval};
use crate::db::requests::RequestStatus;
use crate::db::Database;
use crate::events::{ApprovalEvent, ApprovalEventSender};
use crate::services::job_queue::ExecutorHandle;

pub struct ApprovalGate {
    db: Database,
    executor: Arc<dyn ExecutorHandle>,
    events: ApprovalEventSender,
}

impl ApprovalGate {
    pub fn new(db: Database, executor: Arc<dyn ExecutorHandle>, events: ApprovalEventSender) -> Self {
        Self { db, executor, events }
    }

    pub async fn create_approval(&self, input: CreateApproval) -> Result<Uuid> {
        let record = self.db.approvals().create(input).await?;
        self.emit(record.id, record.request_id, record.status);
        Ok(record.id)
    }

    /// A user's explicit decision (spec.md §4.8 `Process` — approve or
    /// reject only; `skip` is only ever applied as an `autoAction`, never a
    /// user decision). Approve advances the Executor to Downloading;
    /// reject transitions the request to Cancelled.
    pub async fn process(
        &self,
        id: Uuid,
        action: AutoAction,
        processed_by: &str,
        comment: Option<&str>,
    ) -> Result<()> {
        if matches!(action, AutoAction::Skip) {
            return Err(anyhow!("skip is only valid as an auto action, not a user decision"));
        }

        let status = match action {
            AutoAction::Approve => ApprovalStatus::Approved,
            AutoAction::Reject => ApprovalStatus::Rejected,
            AutoAction::Skip => unreachable!(),
        };

        let record = self.db.approvals().process(id, status, processed_by, comment).await?;
        self.emit(record.id, record.request_id, record.status);
        self.apply_action(record.request_id, action).await
    }

    /// Resets the cooldown timer when a user overrides the selected release
    /// during the window (spec.md §4.6 "Approval cooldown").
    pub async fn reset_cooldown(&self, id: Uuid) -> Result<()> {
        self.db.approvals().reset_cooldown(id).await
    }

    /// Overrides `selectedRelease` with the `availableReleases` entry at
    /// `release_index` and resets the pending approval's cooldown timer
    /// (spec.md §4.6: "A user may override the selected release during the
    /// cooldown by choosing a different entry from `availableReleases`; the
    /// override resets the cooldown timer").
    pub async fn override_selection(&self, request_id: Uuid, release_index: usize) -> Result<()> {
        let request = self
            .db
            .requests()
            .get(request_id)
            .await?
            .ok_or_else(|| anyhow!("request {request_id} not found"))?;

        let available = request
            .available_releases
            .ok_or_else(|| anyhow!("request {request_id} has no available releases to choose from"))?;
        let entries = available
            .as_array()
            .ok_or_else(|| anyhow!("available_releases is not a JSON array"))?;
        let chosen = entries
            .get(release_index)
            .ok_or_else(|| anyhow!("release_index {release_index} out of bounds ({} available)", entries.len()))?
            .clone();

        self.db
            .requests()
            .set_selected_release(request_id, Some(chosen), Some(available.clone()))
            .await?;

        let approval = self
            .db
            .approvals()
            .pending_for_request(request_id)
            .await?
            .ok_or_else(|| anyhow!("request {request_id} has no pending approval to reset"))?;
        self.reset_cooldown(approval.id).await
    }

    /// The scheduled `approval:check-timeouts` handler body: marks every
    /// Approval whose cooldown has elapsed Timeout and applies its
    /// `autoAction` to the underlying request.
    pub async fn check_timeouts(&self) -> Result<usize> {
        let due = self.db.approvals().due_for_timeout().await?;
        let mut applied = 0;

        for approval in &due {
            info!(
                approval_id = %approval.id,
                action = ?approval.auto_action,
                "approval cooldown elapsed, applying auto action",
            );
            let record = self
                .db
                .approvals()
                .process(approval.id, ApprovalStatus::Timeout, "system:timeout", None)
                .await?;
            self.emit(record.id, record.request_id, record.status);
            self.apply_action(record.request_id, approval.auto_action).await?;
            applied += 1;
        }

        Ok(applied)
    }

    async fn apply_action(&self, request_id: Uuid, action: AutoAction) -> Result<()> {
        match action {
            AutoAction::Approve | AutoAction::Skip => {
                self.db
                    .requests()
                    .set_status(request_id, RequestStatus::Downloading, "downloading")
                    .await?;
                self.executor.advance(request_id).await?;
            }
            AutoAction::Reject => {
                self.db
                    .requests()
                    .set_status(request_id, RequestStatus::Cancelled, "rejected")
                    .await?;
            }
        }
        Ok(())
    }

    fn emit(&self, approval_id: Uuid, request_id: Uuid, status: ApprovalStatus) {
        let _ = self.events.send(ApprovalEvent { approval_id, request_id, status });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::requests::{CreateRequest, DeliveryTarget, MediaKind};
    use crate::events::approval_event_channel;
    use async_trait::async_trait;
    use sqlx::PgPool;

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

    async fn seed_request(db: &Database) -> Uuid {
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
            .await
            .unwrap();
        request.id
    }

    #[sqlx::test]
    async fn approving_advances_the_request_to_downloading(pool: PgPool) -> anyhow::Result<()> {
        let db = Database::from_pool(pool);
        let (events, _rx) = approval_event_channel();
        let gate = ApprovalGate::new(db.clone(), Arc::new(NullExecutor), events);

        let request_id = seed_request(&db).await;
        let approval_id = gate
            .create_approval(CreateApproval {
                request_id,
                step_order: 1,
                reason: "release selected".to_string(),
                required_role: None,
                timeout_hours: Some(24.0),
                auto_action: AutoAction::Approve,
            })
            .await?;

        gate.process(approval_id, AutoAction::Approve, "alice", None).await?;

        let approval = db.approvals().get(approval_id).await?.unwrap();
        assert_eq!(approval.status, ApprovalStatus::Approved);
        let request = db.requests().get(request_id).await?.unwrap();
        assert_eq!(request.status, RequestStatus::Downloading);
        Ok(())
    }

    #[sqlx::test]
    async fn rejecting_cancels_the_request(pool: PgPool) -> anyhow::Result<()> {
        let db = Database::from_pool(pool);
        let (events, _rx) = approval_event_channel();
        let gate = ApprovalGate::new(db.clone(), Arc::new(NullExecutor), events);

        let request_id = seed_request(&db).await;
        let approval_id = gate
            .create_approval(CreateApproval {
                request_id,
                step_order: 1,
                reason: "release selected".to_string(),
                required_role: None,
                timeout_hours: Some(24.0),
                auto_action: AutoAction::Approve,
            })
            .await?;

        gate.process(approval_id, AutoAction::Reject, "alice", Some("wrong release")).await?;

        let request = db.requests().get(request_id).await?.unwrap();
        assert_eq!(request.status, RequestStatus::Cancelled);
        Ok(())
    }

    #[sqlx::test]
    async fn check_timeouts_applies_auto_action_once_cooldown_elapses(pool: PgPool) -> anyhow::Result<()> {
        let db = Database::from_pool(pool);
        let (events, _rx) = approval_event_channel();
        let gate = ApprovalGate::new(db.clone(), Arc::new(NullExecutor), events);

        let request_id = seed_request(&db).await;
        // A zero-width cooldown is already elapsed by the time the check
        // runs, without needing to backdate `created_at`.
        gate.create_approval(CreateApproval {
            request_id,
            step_order: 1,
            reason: "release selected".to_string(),
            required_role: None,
            timeout_hours: Some(0.0),
            auto_action: AutoAction::Skip,
        })
        .await?;

        let applied = gate.check_timeouts().await?;
        assert_eq!(applied, 1);

        let request = db.requests().get(request_id).await?.unwrap();
        assert_eq!(request.status, RequestStatus::Downloading, "Skip auto-action still advances to Downloading");
        Ok(())
    }

    #[sqlx::test]
    async fn override_selection_swaps_release_and_resets_cooldown(pool: PgPool) -> anyhow::Result<()> {
        let db = Database::from_pool(pool);
        let (events, _rx) = approval_event_channel();
        let gate = ApprovalGate::new(db.clone(), Arc::new(NullExecutor), events);

        let request_id = seed_request(&db).await;
        let releases = serde_json::json!([
            { "title": "Dune 2021 1080p BluRay", "score": 150 },
            { "title": "Dune 2021 2160p BluRay", "score": 190 },
        ]);
        db.requests()
            .set_selected_release(request_id, Some(releases[0].clone()), Some(releases.clone()))
            .await?;
        let approval_id = gate
            .create_approval(CreateApproval {
                request_id,
                step_order: 1,
                reason: "release selected".to_string(),
                required_role: None,
                timeout_hours: Some(24.0),
                auto_action: AutoAction::Approve,
            })
            .await?;
        let before = db.approvals().get(approval_id).await?.unwrap();

        gate.override_selection(request_id, 1).await?;

        let request = db.requests().get(request_id).await?.unwrap();
        assert_eq!(request.selected_release.unwrap(), releases[1]);
        let after = db.approvals().get(approval_id).await?.unwrap();
        assert!(after.created_at >= before.created_at);
        assert_eq!(after.status, ApprovalStatus::Pending, "override does not itself decide the approval");
        Ok(())
    }

    #[sqlx::test]
    async fn check_timeouts_ignores_approvals_still_within_cooldown(pool: PgPool) -> anyhow::Result<()> {
        let db = Database::from_pool(pool);
        let (events, _rx) = approval_event_channel();
        let gate = ApprovalGate::new(db.clone(), Arc::new(NullExecutor), events);

        let request_id = seed_request(&db).await;
        gate.create_approval(CreateApproval {
            request_id,
            step_order: 1,
            reason: "release selected".to_string(),
            required_role: None,
            timeout_hours: Some(24.0),
            auto_action: AutoAction::Approve,
        })
        .await?;

        let applied = gate.check_timeouts().await?;
        assert_eq!(applied, 0);
        Ok(())
    }
}
