//! The Media Server adapter contract consumed by the core (spec.md §6).
//! Concrete adapters (Plex/Jellyfin/Emby-style library scan APIs) are out
//! of scope; only the narrow interface DELIVER and library sync need ships
//! here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::services::indexer::MediaKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryItem {
    pub external_id: String,
    pub kind: MediaKind,
    pub title: String,
    pub year: Option<i32>,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct FetchLibraryOptions {
    pub kind: Option<MediaKind>,
    pub since: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait MediaServerAdapter: Send + Sync {
    async fn fetch_library(
        &self,
        server_url: &str,
        api_key: &str,
        opts: FetchLibraryOptions,
    ) -> anyhow::Result<Vec<LibraryItem>>;

    async fn trigger_scan(&self, server_url: &str, api_key: &str) -> anyhow::Result<()>;
}
