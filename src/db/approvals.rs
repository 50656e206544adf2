//! Approval persistence
//!
//! Mirrors the teacher's `db/rss_feeds.rs` repository shape: a plain struct,
//! a `Create*` input type, and a thin `*Repository` wrapping the pool.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Skipped,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AutoAction {
    Approve,
    Reject,
    Skip,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct ApprovalRecord {
    pub id: Uuid,
    pub request_id: Uuid,
    pub step_order: i32,
    pub reason: String,
    pub required_role: Option<String>,
    pub timeout_hours: Option<f64>,
    pub auto_action: AutoAction,
    pub status: ApprovalStatus,
    pub processed_by: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct CreateApproval {
    pub request_id: Uuid,
    pub step_order: i32,
    pub reason: String,
    pub required_role: Option<String>,
    pub timeout_hours: Option<f64>,
    pub auto_action: AutoAction,
}

pub struct ApprovalRepository {
    pool: PgPool,
}

impl ApprovalRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, input: CreateApproval) -> Result<ApprovalRecord> {
        let record = sqlx::query_as::<_, ApprovalRecord>(
            r#"
            INSERT INTO approval (request_id, step_order, reason, required_role, timeout_hours, auto_action, status)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending')
            RETURNING *
            "#,
        )
        .bind(input.request_id)
        .bind(input.step_order)
        .bind(&input.reason)
        .bind(&input.required_role)
        .bind(input.timeout_hours)
        .bind(input.auto_action)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<ApprovalRecord>> {
        let record = sqlx::query_as::<_, ApprovalRecord>("SELECT * FROM approval WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    /// Pending approval for a request, if any. Used to find the "current"
    /// gate when processing a user decision.
    pub async fn pending_for_request(&self, request_id: Uuid) -> Result<Option<ApprovalRecord>> {
        let record = sqlx::query_as::<_, ApprovalRecord>(
            "SELECT * FROM approval WHERE request_id = $1 AND status = 'pending' ORDER BY step_order DESC LIMIT 1",
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Resets the cooldown timer by touching `created_at`, used when a user
    /// overrides the selected release during the cooldown window.
    pub async fn reset_cooldown(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE approval SET created_at = now(), updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn process(
        &self,
        id: Uuid,
        status: ApprovalStatus,
        processed_by: &str,
        comment: Option<&str>,
    ) -> Result<ApprovalRecord> {
        let record = sqlx::query_as::<_, ApprovalRecord>(
            r#"
            UPDATE approval
            SET status = $2, processed_by = $3, processed_at = now(), comment = $4, updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(processed_by)
        .bind(comment)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    /// Approvals whose cooldown has elapsed: `created_at + timeout_hours < now()`.
    /// Polled every 5 minutes by the `approval:check-timeouts` scheduler task.
    pub async fn due_for_timeout(&self) -> Result<Vec<ApprovalRecord>> {
        let records = sqlx::query_as::<_, ApprovalRecord>(
            r#"
            SELECT * FROM approval
            WHERE status = 'pending'
              AND timeout_hours IS NOT NULL
              AND created_at + (timeout_hours || ' hours')::interval < now()
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}
