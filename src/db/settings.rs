//! Runtime-tunable settings (e.g. `search.retryIntervalHours` overrides).
//!
//! Grounded on the teacher's `db/settings.rs` key/value-with-category shape.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SettingRecord {
    pub id: Uuid,
    pub key: String,
    pub value: JsonValue,
    pub description: Option<String>,
    pub category: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct SettingsRepository {
    pool: PgPool,
}

impl SettingsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> Result<Option<SettingRecord>> {
        let record = sqlx::query_as::<_, SettingRecord>("SELECT * FROM setting WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    pub async fn get_value<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(r) => Ok(Some(serde_json::from_value(r.value)?)),
            None => Ok(None),
        }
    }

    pub async fn get_or_default<T: serde::de::DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        match self.get_value(key).await? {
            Some(v) => Ok(v),
            None => Ok(default),
        }
    }

    pub async fn set<T: serde::Serialize>(&self, key: &str, value: T, category: &str) -> Result<SettingRecord> {
        let json_value = serde_json::to_value(value)?;
        let record = sqlx::query_as::<_, SettingRecord>(
            r#"
            INSERT INTO setting (key, value, category)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE SET value = $2, category = $3, updated_at = now()
            RETURNING *
            "#,
        )
        .bind(key)
        .bind(json_value)
        .bind(category)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn list_all(&self) -> Result<Vec<SettingRecord>> {
        let records = sqlx::query_as::<_, SettingRecord>("SELECT * FROM setting ORDER BY category, key")
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }
}
