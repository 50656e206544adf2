//! The Download Client contract consumed by the core (spec.md §6). Concrete
//! torrent/Usenet adapters are out of scope; only the narrow interface the
//! DOWNLOAD stage needs ships here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    Queued,
    Downloading,
    Stalled,
    Checking,
    Extracting,
    Complete,
    Seeding,
    Paused,
    Error,
    Unknown,
}

#[derive(Debug, Clone, Default)]
pub struct AddDownloadOptions {
    pub save_path: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone)]
pub enum DownloadSource {
    Url(String),
    Magnet(String),
    FileBytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub state: DownloadState,
    pub progress_pct: f64,
    pub downloaded_bytes: i64,
    pub total_bytes: i64,
    pub eta_seconds: Option<i64>,
    pub speed_bytes_per_sec: Option<i64>,
    pub is_complete: bool,
}

#[derive(Debug, Clone)]
pub struct MainVideoFile {
    pub path: String,
    pub size_bytes: i64,
}

#[async_trait]
pub trait DownloadClient: Send + Sync {
    async fn add(&self, source: DownloadSource, opts: AddDownloadOptions) -> anyhow::Result<String>;
    async fn get_progress(&self, client_hash: &str) -> anyhow::Result<DownloadProgress>;
    async fn get_main_video_file(&self, client_hash: &str) -> anyhow::Result<MainVideoFile>;
    async fn pause(&self, client_hash: &str) -> anyhow::Result<()>;
    async fn resume(&self, client_hash: &str) -> anyhow::Result<()>;
    async fn delete(&self, client_hash: &str) -> anyhow::Result<()>;
}
