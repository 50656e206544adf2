//! The Release data model — an in-memory candidate never persisted
//! standalone by the core (spec.md §3), styled on the teacher's
//! `indexer/types.rs::ReleaseInfo`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Sd,
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "2160p")]
    P2160,
}

impl Resolution {
    /// Points contributed by this resolution to the additive score table.
    pub fn score(self) -> i64 {
        match self {
            Resolution::P2160 => 100,
            Resolution::P1080 => 80,
            Resolution::P720 => 60,
            Resolution::P480 => 40,
            Resolution::Sd => 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Remux,
    #[serde(rename = "bluray")]
    BluRay,
    #[serde(rename = "webdl")]
    WebDL,
    #[serde(rename = "webrip")]
    WebRip,
    Hdtv,
    Dvdrip,
    Cam,
    Unknown,
}

impl Source {
    pub fn score(self) -> i64 {
        match self {
            Source::Remux => 50,
            Source::BluRay => 40,
            Source::WebDL => 35,
            Source::WebRip => 30,
            Source::Hdtv => 25,
            Source::Dvdrip => 15,
            Source::Cam => 5,
            Source::Unknown => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Av1,
    Hevc,
    H264,
    Unknown,
}

impl Codec {
    pub fn score(self) -> i64 {
        match self {
            Codec::Av1 => 15,
            Codec::Hevc => 12,
            Codec::H264 => 10,
            Codec::Unknown => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    pub title: String,
    pub indexer_id: Uuid,
    pub indexer_name: String,
    pub resolution: Resolution,
    pub source: Source,
    pub codec: Codec,
    pub size_bytes: i64,
    pub seeders: i64,
    pub leechers: i64,
    pub download_url: Option<String>,
    pub magnet_uri: Option<String>,
    pub publish_date: DateTime<Utc>,
    pub categories: Vec<String>,
    /// Computed by the selector; `0` until scored.
    #[serde(default)]
    pub score: i64,
}

impl Release {
    /// Invariant from spec.md §3: at least one acquisition URL is present.
    pub fn has_acquisition_url(&self) -> bool {
        self.download_url.is_some() || self.magnet_uri.is_some()
    }

    pub fn normalized_title(&self) -> String {
        normalize_title(&self.title)
    }
}

/// Lowercases and strips all non-alphanumerics, per spec.md §4.4
/// deduplication rule.
pub fn normalize_title(title: &str) -> String {
    title
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_title_strips_punctuation_and_case() {
        assert_eq!(normalize_title("Dune.2021.1080p.WEB-DL"), "dune20211080pwebdl");
        assert_eq!(normalize_title("Dune 2021 (1080p)"), "dune20211080p");
    }

    #[test]
    fn resolution_scores_match_table() {
        assert_eq!(Resolution::P2160.score(), 100);
        assert_eq!(Resolution::Sd.score(), 20);
    }
}
