//! Job and approval event buses
//!
//! The queue and the approval gate emit lifecycle events to any subscriber;
//! the (out-of-scope) transport layer maps this to WebSocket/SSE. Modeled as
//! `tokio::sync::broadcast` channels, the same primitive the teacher uses
//! for its GraphQL subscription events (`graphql/types.rs`'s
//! `MediaFileUpdatedEvent` broadcast sender).

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::db::approvals::ApprovalStatus;
use crate::services::job_queue::JobType;

/// A point-in-time snapshot of a job's lifecycle, broadcast on every status
/// change. Per spec: created -> started -> (progress)* -> (completed | failed | cancelled),
/// in order, per job id.
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub id: Uuid,
    pub job_type: JobType,
    pub status: JobEventStatus,
    pub progress_pct: Option<f64>,
    pub current: Option<i64>,
    pub total: Option<i64>,
    pub request_id: Option<Uuid>,
    pub parent_job_id: Option<Uuid>,
    pub dedupe_key: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobEventStatus {
    Created,
    Started,
    Progress,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalEvent {
    pub approval_id: Uuid,
    pub request_id: Uuid,
    pub status: ApprovalStatus,
}

pub type JobEventSender = tokio::sync::broadcast::Sender<JobEvent>;
pub type JobEventReceiver = tokio::sync::broadcast::Receiver<JobEvent>;
pub type ApprovalEventSender = tokio::sync::broadcast::Sender<ApprovalEvent>;
pub type ApprovalEventReceiver = tokio::sync::broadcast::Receiver<ApprovalEvent>;

/// Default broadcast channel capacity; mirrors the teacher's
/// `DatabaseLoggerConfig::broadcast_capacity` default of 1000.
pub const DEFAULT_EVENT_CAPACITY: usize = 1000;

pub fn job_event_channel() -> (JobEventSender, JobEventReceiver) {
    tokio::sync::broadcast::channel(DEFAULT_EVENT_CAPACITY)
}

pub fn approval_event_channel() -> (ApprovalEventSender, ApprovalEventReceiver) {
    tokio::sync::broadcast::channel(DEFAULT_EVENT_CAPACITY)
}
