//! Placeholder adapters for the external collaborators spec.md §6 reduces
//! to narrow trait contracts but explicitly keeps out of the core's scope
//! (indexer protocol adapters, download clients, media-server adapters).
//! A real deployment drops its own trait implementation in; these exist so
//! the binary links and runs with zero indexers/clients configured rather
//! than requiring `Option`-wrapped plumbing through the whole pipeline.

use async_trait::async_trait;

use crate::services::download::{
    AddDownloadOptions, DownloadClient, DownloadProgress, DownloadSource, MainVideoFile,
};
use crate::services::media_server::{FetchLibraryOptions, LibraryItem, MediaServerAdapter};

pub struct UnconfiguredDownloadClient;

#[async_trait]
impl DownloadClient for UnconfiguredDownloadClient {
    async fn add(&self, _source: DownloadSource, _opts: AddDownloadOptions) -> anyhow::Result<String> {
        anyhow::bail!("no download client adapter configured")
    }

    async fn get_progress(&self, _client_hash: &str) -> anyhow::Result<DownloadProgress> {
        anyhow::bail!("no download client adapter configured")
    }

    async fn get_main_video_file(&self, _client_hash: &str) -> anyhow::Result<MainVideoFile> {
        anyhow::bail!("no download client adapter configured")
    }

    async fn pause(&self, _client_hash: &str) -> anyhow::Result<()> {
        anyhow::bail!("no download client adapter configured")
    }

    async fn resume(&self, _client_hash: &str) -> anyhow::Result<()> {
        anyhow::bail!("no download client adapter configured")
    }

    async fn delete(&self, _client_hash: &str) -> anyhow::Result<()> {
        anyhow::bail!("no download client adapter configured")
    }
}

pub struct UnconfiguredMediaServerAdapter;

#[async_trait]
impl MediaServerAdapter for UnconfiguredMediaServerAdapter {
    async fn fetch_library(
        &self,
        _server_url: &str,
        _api_key: &str,
        _opts: FetchLibraryOptions,
    ) -> anyhow::Result<Vec<LibraryItem>> {
        anyhow::bail!("no media server adapter configured")
    }

    async fn trigger_scan(&self, _server_url: &str, _api_key: &str) -> anyhow::Result<()> {
        anyhow::bail!("no media server adapter configured")
    }
}
