//! Per-episode / per-season-pack processing units for Series requests.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::requests::RequestStatus;

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct ProcessingItemRecord {
    pub id: Uuid,
    pub request_id: Uuid,
    pub season: i32,
    pub episode: Option<i32>,
    pub status: RequestStatus,
    pub quality_met: bool,
    pub available_releases: Option<Value>,
    pub selected_release: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct CreateProcessingItem {
    pub request_id: Uuid,
    pub season: i32,
    pub episode: Option<i32>,
}

pub struct ProcessingItemRepository {
    pool: PgPool,
}

impl ProcessingItemRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, input: CreateProcessingItem) -> Result<ProcessingItemRecord> {
        let record = sqlx::query_as::<_, ProcessingItemRecord>(
            r#"
            INSERT INTO processing_item (request_id, season, episode, status, quality_met)
            VALUES ($1, $2, $3, 'new', false)
            RETURNING *
            "#,
        )
        .bind(input.request_id)
        .bind(input.season)
        .bind(input.episode)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn list_for_request(&self, request_id: Uuid) -> Result<Vec<ProcessingItemRecord>> {
        let records = sqlx::query_as::<_, ProcessingItemRecord>(
            "SELECT * FROM processing_item WHERE request_id = $1 ORDER BY season ASC, episode ASC NULLS FIRST",
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn list_awaiting_for_season(&self, request_id: Uuid, season: i32) -> Result<Vec<ProcessingItemRecord>> {
        let records = sqlx::query_as::<_, ProcessingItemRecord>(
            "SELECT * FROM processing_item WHERE request_id = $1 AND season = $2 AND status = 'awaiting'",
        )
        .bind(request_id)
        .bind(season)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn set_status(&self, id: Uuid, status: RequestStatus) -> Result<ProcessingItemRecord> {
        let record = sqlx::query_as::<_, ProcessingItemRecord>(
            "UPDATE processing_item SET status = $2, updated_at = now() WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    /// Transitions every currently-Awaiting episode ProcessingItem for a
    /// season at once — the season-pack invariant from spec.md §3.
    pub async fn set_status_for_season(
        &self,
        request_id: Uuid,
        season: i32,
        status: RequestStatus,
    ) -> Result<Vec<ProcessingItemRecord>> {
        let records = sqlx::query_as::<_, ProcessingItemRecord>(
            r#"
            UPDATE processing_item SET status = $3, updated_at = now()
            WHERE request_id = $1 AND season = $2 AND status = 'awaiting'
            RETURNING *
            "#,
        )
        .bind(request_id)
        .bind(season)
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn set_selected_release(
        &self,
        id: Uuid,
        selected_release: Option<Value>,
        available_releases: Option<Value>,
    ) -> Result<ProcessingItemRecord> {
        let record = sqlx::query_as::<_, ProcessingItemRecord>(
            r#"
            UPDATE processing_item SET selected_release = $2, available_releases = $3, updated_at = now()
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
}
