//! Media request persistence.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Movie,
    Series,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    New,
    Searching,
    Awaiting,
    QualityUnavailable,
    PendingApproval,
    Downloading,
    Encoding,
    Delivering,
    Complete,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryTarget {
    pub server_id: String,
    pub encoding_profile_id: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct RequestRecord {
    pub id: Uuid,
    pub external_id: Option<String>,
    pub kind: MediaKind,
    pub title: String,
    pub year: Option<i32>,
    pub targets: Value,
    pub required_resolution: Option<String>,
    pub selected_release: Option<Value>,
    pub available_releases: Option<Value>,
    pub status: RequestStatus,
    pub current_step: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct CreateRequest {
    pub external_id: Option<String>,
    pub kind: MediaKind,
    pub title: String,
    pub year: Option<i32>,
    pub targets: Vec<DeliveryTarget>,
    pub required_resolution: Option<String>,
    /// For `MediaKind::Series`, the `(season, episode)` units to create as
    /// child ProcessingItems alongside the request — `episode: None` for a
    /// season-pack unit (spec.md §3 "one row per target episode (or per
    /// season pack)"). Ignored for `MediaKind::Movie`.
    pub series_items: Vec<(i32, Option<i32>)>,
}

pub struct RequestRepository {
    pool: PgPool,
}

impl RequestRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts the Request row and, for a Series request, its initial
    /// per-episode/season-pack ProcessingItem children, in one transaction
    /// (spec.md §3's ProcessingItem is a child unit that must exist before
    /// `tv:search` has anything to search for).
    pub async fn create(&self, input: CreateRequest) -> Result<RequestRecord> {
        let targets = serde_json::to_value(&input.targets)?;
        let mut tx = self.pool.begin().await?;

        let record = sqlx::query_as::<_, RequestRecord>(
            r#"
            INSERT INTO media_request (external_id, kind, title, year, targets, required_resolution, status, current_step)
            VALUES ($1, $2, $3, $4, $5, $6, 'new', 'new')
            RETURNING *
            "#,
        )
        .bind(&input.external_id)
        .bind(input.kind)
        .bind(&input.title)
        .bind(input.year)
        .bind(targets)
        .bind(&input.required_resolution)
        .fetch_one(&mut *tx)
        .await?;

        if input.kind == MediaKind::Series {
            for (season, episode) in &input.series_items {
                sqlx::query(
                    "INSERT INTO processing_item (request_id, season, episode, status, quality_met) VALUES ($1, $2, $3, 'new', false)",
                )
                .bind(record.id)
                .bind(season)
                .bind(episode)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(record)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<RequestRecord>> {
        let record = sqlx::query_as::<_, RequestRecord>("SELECT * FROM media_request WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    pub async fn set_status(&self, id: Uuid, status: RequestStatus, current_step: &str) -> Result<RequestRecord> {
        let record = sqlx::query_as::<_, RequestRecord>(
            r#"
            UPDATE media_request SET status = $2, current_step = $3, updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(current_step)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn set_selected_release(
        &self,
        id: Uuid,
        selected_release: Option<Value>,
        available_releases: Option<Value>,
    ) -> Result<RequestRecord> {
        let record = sqlx::query_as::<_, RequestRecord>(
            r#"
            UPDATE media_request SET selected_release = $2, available_releases = $3, updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(selected_release)
        .bind(available_releases)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    /// Requests sitting in Awaiting or QualityUnavailable — the announce
    /// listeners' match pipeline scans these for a candidate upgrade.
    pub async fn awaiting_or_quality_unavailable(&self) -> Result<Vec<RequestRecord>> {
        let records = sqlx::query_as::<_, RequestRecord>(
            "SELECT * FROM media_request WHERE status IN ('awaiting', 'quality_unavailable')",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Distinct `server_id`s referenced across every Request's `targets`,
    /// used by `library:sync` to fan out a `library:sync-server` job per
    /// server without a separate MediaServer registry table.
    pub async fn distinct_target_server_ids(&self) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT elem ->> 'server_id'
            FROM media_request, jsonb_array_elements(targets) AS elem
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    pub async fn due_for_retry(&self, retry_interval_hours: f64) -> Result<Vec<RequestRecord>> {
        let records = sqlx::query_as::<_, RequestRecord>(
            r#"
            SELECT * FROM media_request
            WHERE status = 'awaiting'
              AND updated_at < now() - ($1 || ' hours')::interval
            "#,
        )
        .bind(retry_interval_hours)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}
