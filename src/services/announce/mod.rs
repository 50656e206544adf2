//! Shared match pipeline for the two announce channels (spec.md §4.7,
//! §4.9 "Announce and Search share the match pipeline"): a pure
//! title+year+SxxEyy+resolution matcher consumed by the RSS poller and the
//! IRC listener, plus the stateful short-circuit that writes a matched
//! release straight into a waiting request (spec.md §4.6 "Announce
//! short-circuit").

pub mod irc;
pub mod rss;

use anyhow::Result;
use regex::Regex;
use uuid::Uuid;

use crate::db::jobs::AddJobOptions;
use crate::db::processing_items::ProcessingItemRecord;
use crate::db::requests::{MediaKind, RequestRecord};
use crate::db::Database;
use crate::services::job_queue::{JobPayload, JobQueue, JobType};
use crate::services::quality::release::{normalize_title, Codec, Release, Resolution, Source};

/// One release announced over RSS or IRC, before it has been matched
/// against any waiting request.
#[derive(Debug, Clone)]
pub struct AnnouncedRelease {
    pub title: String,
    pub download_url: Option<String>,
    pub magnet_uri: Option<String>,
    pub size_bytes: i64,
    pub seeders: i64,
    pub leechers: i64,
    pub indexer_name: String,
    pub indexer_id: Uuid,
    pub publish_date: chrono::DateTime<chrono::Utc>,
}

/// Extracted from the release title; the quality-gate half of the match
/// pipeline reuses these the same way the Release Selector does.
#[derive(Debug, Clone, Copy)]
struct ParsedQuality {
    resolution: Resolution,
    source: Source,
    codec: Codec,
}

fn parse_quality(title: &str) -> ParsedQuality {
    let lower = title.to_lowercase();

    let resolution = if lower.contains("2160p") || lower.contains("4k") {
        Resolution::P2160
    } else if lower.contains("1080p") {
        Resolution::P1080
    } else if lower.contains("720p") {
        Resolution::P720
    } else if lower.contains("480p") {
        Resolution::P480
    } else {
        Resolution::Sd
    };

    let source = if lower.contains("remux") {
        Source::Remux
    } else if lower.contains("bluray") || lower.contains("blu-ray") || lower.contains("bdrip") {
        Source::BluRay
    } else if lower.contains("web-dl") || lower.contains("webdl") {
        Source::WebDL
    } else if lower.contains("webrip") {
        Source::WebRip
    } else if lower.contains("hdtv") {
        Source::Hdtv
    } else if lower.contains("dvdrip") {
        Source::Dvdrip
    } else if lower.contains("cam") || lower.contains("hdcam") {
        Source::Cam
    } else {
        Source::Unknown
    };

    let codec = if lower.contains("av1") {
        Codec::Av1
    } else if lower.contains("hevc") || lower.contains("x265") || lower.contains("h265") || lower.contains("h.265") {
        Codec::Hevc
    } else if lower.contains("x264") || lower.contains("h264") || lower.contains("h.264") {
        Codec::H264
    } else {
        Codec::Unknown
    };

    ParsedQuality { resolution, source, codec }
}

fn year_regex() -> &'static Regex {
    static RE: once_cell::sync::OnceCell<Regex> = once_cell::sync::OnceCell::new();
    RE.get_or_init(|| Regex::new(r"(?:19|20)\d{2}").unwrap())
}

fn season_episode_regex() -> &'static Regex {
    static RE: once_cell::sync::OnceCell<Regex> = once_cell::sync::OnceCell::new();
    RE.get_or_init(|| Regex::new(r"(?i)S(\d{1,2})E(\d{1,2})").unwrap())
}

fn season_pack_regex() -> &'static Regex {
    static RE: once_cell::sync::OnceCell<Regex> = once_cell::sync::OnceCell::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bS(\d{1,2})\b(?!E\d)").unwrap())
}

fn extract_year(title: &str) -> Option<i32> {
    year_regex().find(title).and_then(|m| m.as_str().parse().ok())
}

/// `(season, episode)`, `episode` is `None` for a season pack.
fn extract_season_episode(title: &str) -> Option<(i32, Option<i32>)> {
    if let Some(caps) = season_episode_regex().captures(title) {
        let season: i32 = caps[1].parse().ok()?;
        let episode: i32 = caps[2].parse().ok()?;
        return Some((season, Some(episode)));
    }
    if let Some(caps) = season_pack_regex().captures(title) {
        let season: i32 = caps[1].parse().ok()?;
        return Some((season, None));
    }
    None
}

/// Builds the in-memory `Release` the executor already knows how to
/// consume, from a raw announce. Grounded on the scoring fields the
/// Release Selector already assigns (spec.md §4.4).
pub fn to_release(announced: &AnnouncedRelease) -> Release {
    let quality = parse_quality(&announced.title);
    Release {
        title: announced.title.clone(),
        indexer_id: announced.indexer_id,
        indexer_name: announced.indexer_name.clone(),
        resolution: quality.resolution,
        source: quality.source,
        codec: quality.codec,
        size_bytes: announced.size_bytes,
        seeders: announced.seeders,
        leechers: announced.leechers,
        download_url: announced.download_url.clone(),
        magnet_uri: announced.magnet_uri.clone(),
        publish_date: announced.publish_date,
        categories: Vec::new(),
        score: 0,
    }
}

fn title_matches(announced_title: &str, target_title: &str) -> bool {
    let a = normalize_title(announced_title);
    let b = normalize_title(target_title);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a.contains(&b) || b.contains(&a) || strsim::jaro_winkler(&a, &b) >= 0.92
}

fn resolution_rank(resolution: Resolution) -> u8 {
    match resolution {
        Resolution::Sd => 0,
        Resolution::P480 => 1,
        Resolution::P720 => 2,
        Resolution::P1080 => 3,
        Resolution::P2160 => 4,
    }
}

fn meets_resolution(resolution: Resolution, required: Option<Resolution>) -> bool {
    match required {
        Some(required) => resolution_rank(resolution) >= resolution_rank(required),
        None => true,
    }
}

fn parse_required_resolution(s: Option<&str>) -> Option<Resolution> {
    s.and_then(|s| serde_json::from_value(serde_json::Value::String(s.to_string())).ok())
}

/// The pure match pipeline (spec.md §4.7, §4.9): title similarity AND a
/// year-or-SxxEyy marker present AND the announced resolution clears the
/// request's quality gate. Used for movie Requests; `matches_series` is the
/// ProcessingItem counterpart.
pub fn matches_movie(announced: &AnnouncedRelease, release: &Release, request: &RequestRecord) -> bool {
    if request.kind != MediaKind::Movie {
        return false;
    }
    if !title_matches(&announced.title, &request.title) {
        return false;
    }
    if let (Some(expected), Some(found)) = (request.year, extract_year(&announced.title)) {
        if expected != found {
            return false;
        }
    } else if request.year.is_some() {
        return false;
    }
    meets_resolution(release.resolution, parse_required_resolution(request.required_resolution.as_deref()))
}

/// The ProcessingItem counterpart of [`matches_movie`] for Series requests;
/// `item.episode` distinguishes an episode match from a season-pack match.
pub fn matches_series_item(
    announced: &AnnouncedRelease,
    release: &Release,
    request: &RequestRecord,
    item: &ProcessingItemRecord,
) -> bool {
    if request.kind != MediaKind::Series {
        return false;
    }
    if !title_matches(&announced.title, &request.title) {
        return false;
    }
    let Some((season, episode)) = extract_season_episode(&announced.title) else {
        return false;
    };
    if season != item.season {
        return false;
    }
    if item.episode != episode {
        return false;
    }
    meets_resolution(release.resolution, parse_required_resolution(request.required_resolution.as_deref()))
}

/// Owns the stateful half of the announce short-circuit: given a parsed
/// announce, scans every Awaiting/QualityUnavailable request and
/// ProcessingItem and, on the first hit, writes the release and jumps the
/// request straight to Downloading (spec.md §4.6).
pub struct AnnounceMatcher {
    db: Database,
    queue: std::sync::Arc<JobQueue>,
}

impl AnnounceMatcher {
    pub fn new(db: Database, queue: std::sync::Arc<JobQueue>) -> Self {
        Self { db, queue }
    }

    /// Returns `true` if the announce matched and was applied.
    pub async fn try_match(&self, announced: &AnnouncedRelease) -> Result<bool> {
        let release = to_release(announced);
        let candidates = self.db.requests().awaiting_or_quality_unavailable().await?;

        for request in &candidates {
            match request.kind {
                MediaKind::Movie => {
                    if matches_movie(announced, &release, request) {
                        self.apply_movie(request, &release).await?;
                        return Ok(true);
                    }
                }
                MediaKind::Series => {
                    let items = self.db.processing_items().list_for_request(request.id).await?;
                    for item in items.iter().filter(|i| i.status == crate::db::requests::RequestStatus::Awaiting) {
                        if matches_series_item(announced, &release, request, item) {
                            self.apply_series(request, item, &release).await?;
                            return Ok(true);
                        }
                    }
                }
            }
        }

        Ok(false)
    }

    async fn apply_movie(&self, request: &RequestRecord, release: &Release) -> Result<()> {
        let selected = serde_json::to_value(release)?;
        self.db.requests().set_selected_release(request.id, Some(selected), None).await?;
        self.db.requests().set_status(request.id, crate::db::requests::RequestStatus::Downloading, "announce upgrade").await?;

        let opts = AddJobOptions { request_id: Some(request.id), ..AddJobOptions::new() };
        self.queue
            .add_if_not_exists(
                JobType::PipelineDownload,
                &JobPayload::PipelineDownload { request_id: request.id },
                &format!("pipeline:download:{}", request.id),
                opts,
            )
            .await?;
        Ok(())
    }

    async fn apply_series(
        &self,
        request: &RequestRecord,
        item: &ProcessingItemRecord,
        release: &Release,
    ) -> Result<()> {
        let selected = serde_json::to_value(release)?;
        self.db.processing_items().set_selected_release(item.id, Some(selected), None).await?;
        self.db
            .processing_items()
            .set_status(item.id, crate::db::requests::RequestStatus::Downloading)
            .await?;

        let opts = AddJobOptions { request_id: Some(request.id), ..AddJobOptions::new() };
        if item.episode.is_none() {
            self.queue
                .add_if_not_exists(
                    JobType::TvDownloadSeason,
                    &JobPayload::TvDownloadSeason { request_id: request.id, season: item.season },
                    &format!("tv:download-season:{}:{}", request.id, item.season),
                    opts,
                )
                .await?;
        } else {
            self.queue
                .add_if_not_exists(
                    JobType::TvDownloadEpisode,
                    &JobPayload::TvDownloadEpisode { request_id: request.id, processing_item_id: item.id },
                    &format!("tv:download-episode:{}", item.id),
                    opts,
                )
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn announced(title: &str) -> AnnouncedRelease {
        AnnouncedRelease {
            title: title.to_string(),
            download_url: Some("https://example.com/a.torrent".to_string()),
            magnet_uri: None,
            size_bytes: 1_000_000,
            seeders: 10,
            leechers: 1,
            indexer_name: "announce".to_string(),
            indexer_id: Uuid::nil(),
            publish_date: Utc::now(),
        }
    }

    #[test]
    fn extracts_year_and_season_episode() {
        assert_eq!(extract_year("Dune.2021.1080p.BluRay.x265"), Some(2021));
        assert_eq!(extract_season_episode("Chicago.Fire.S14E08.1080p.WEB"), Some((14, Some(8))));
        assert_eq!(extract_season_episode("Chicago.Fire.S14.COMPLETE.1080p.WEB"), Some((14, None)));
        assert_eq!(extract_season_episode("Dune.2021.1080p.BluRay"), None);
    }

    #[test]
    fn movie_match_requires_year_and_resolution_gate() {
        let a = announced("Dune.2021.1080p.BluRay.x265");
        let release = to_release(&a);
        let request = RequestRecord {
            id: Uuid::nil(),
            external_id: None,
            kind: MediaKind::Movie,
            title: "Dune".to_string(),
            year: Some(2021),
            targets: serde_json::json!([]),
            required_resolution: Some("1080p".to_string()),
            selected_release: None,
            available_releases: None,
            status: crate::db::requests::RequestStatus::QualityUnavailable,
            current_step: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(matches_movie(&a, &release, &request));

        let wrong_year = RequestRecord { year: Some(1984), ..request.clone() };
        assert!(!matches_movie(&a, &release, &wrong_year));

        let too_high_bar = RequestRecord { required_resolution: Some("2160p".to_string()), ..request };
        assert!(!matches_movie(&a, &release, &too_high_bar));
    }
}
