//! The Release Selector — a pure function mapping candidate releases +
//! constraints to a scored, deduplicated, ordered list and a winner
//! (spec.md §4.4). No DB or IO; fully unit-testable.

use crate::services::quality::release::{normalize_title, Release, Resolution};

#[derive(Debug, Clone, Default)]
pub struct SelectionConstraints {
    pub max_size: Option<i64>,
    pub min_seeders: Option<i64>,
    pub preferred_resolution: Option<Resolution>,
    pub required_resolution: Option<Resolution>,
}

#[derive(Debug, Clone)]
pub struct SelectionResult {
    /// Scored, deduplicated, ordered candidates that survived constraints.
    pub releases: Vec<Release>,
    /// Highest-ranked survivor, or `None` if nothing survived.
    pub winner: Option<Release>,
    /// The scored, deduplicated list *before* constraint filtering — used
    /// by the Executor for the `QualityUnavailable` edge case (spec.md
    /// §4.4 "Quality-gate edge case").
    pub raw: Vec<Release>,
}

const AUDIO_BONUSES: &[(&str, i64)] = &[
    ("ATMOS", 8),
    ("TRUEHD", 7),
    ("DTS-HD", 6),
    ("DTS", 4),
    ("AAC", 3),
];

/// Additive integer score per spec.md §4.4's table. Audio bonuses are
/// matched against the uppercased title and each contributes at most once;
/// matches are checked most-specific first so e.g. "DTS-HD" doesn't also
/// trigger the plain "DTS" bonus.
fn score_release(release: &Release, seeders: i64) -> i64 {
    let mut score = release.resolution.score() + release.source.score() + release.codec.score();

    let upper_title = release.title.to_uppercase();
    for (marker, bonus) in AUDIO_BONUSES {
        if upper_title.contains(marker) {
            score += bonus;
            break;
        }
    }

    if seeders > 0 {
        let seeder_bonus = ((seeders as f64).log10() * 5.0).floor() as i64;
        score += seeder_bonus.clamp(0, 20);
    }

    if upper_title.contains("SAMPLE") {
        score -= 100;
    }
    if upper_title.contains("HARDCODED") || upper_title.contains("HC ") {
        score -= 30;
    }
    if contains_non_english_marker(&upper_title) {
        score -= 20;
    }

    score
}

fn contains_non_english_marker(upper_title: &str) -> bool {
    const MARKERS: &[&str] = &["VOSTFR", "LATINO", "RUSSIAN", "GERMAN", "FRENCH", "ITALIAN", "MULTI"];
    MARKERS.iter().any(|m| upper_title.contains(m))
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

/// Scores every candidate, then deduplicates by normalized title keeping
/// the highest scorer, then sorts deterministically: score DESC, then
/// `publishDate` DESC, then `indexerName` ASC.
fn score_and_dedup(candidates: &[Release]) -> Vec<Release> {
    use std::collections::HashMap;

    let mut best_by_title: HashMap<String, Release> = HashMap::new();

    for candidate in candidates {
        let mut scored = candidate.clone();
        scored.score = score_release(candidate, candidate.seeders);

        let key = normalize_title(&candidate.title);
        match best_by_title.get(&key) {
            Some(existing) if existing.score >= scored.score => {}
            _ => {
                best_by_title.insert(key, scored);
            }
        }
    }

    let mut result: Vec<Release> = best_by_title.into_values().collect();
    result.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| b.publish_date.cmp(&a.publish_date))
            .then_with(|| a.indexer_name.cmp(&b.indexer_name))
    });
    result
}

fn apply_constraints(scored: &[Release], constraints: &SelectionConstraints) -> Vec<Release> {
    scored
        .iter()
        .filter(|r| constraints.max_size.is_none_or(|max| r.size_bytes <= max))
        .filter(|r| constraints.min_seeders.is_none_or(|min| r.seeders >= min))
        .filter(|r| {
            constraints
                .required_resolution
                .is_none_or(|required| resolution_rank(r.resolution) >= resolution_rank(required))
        })
        .cloned()
        .collect()
}

/// Pure: identical input + constraints yields identical ordering and winner
/// (spec.md §8 property 4). After normalization, no two releases in the
/// output share a normalized title (property 5).
pub fn select(candidates: &[Release], constraints: &SelectionConstraints) -> SelectionResult {
    let raw = score_and_dedup(candidates);
    let filtered = apply_constraints(&raw, constraints);

    let winner = match constraints.preferred_resolution {
        Some(preferred) => filtered
            .iter()
            .filter(|r| r.resolution == preferred)
            .max_by_key(|r| r.score)
            .cloned()
            .or_else(|| filtered.first().cloned()),
        None => filtered.first().cloned(),
    };

    SelectionResult {
        releases: filtered,
        winner,
        raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::quality::release::{Codec, Source};
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn release(title: &str, resolution: Resolution, source: Source, seeders: i64) -> Release {
        Release {
            title: title.to_string(),
            indexer_id: Uuid::nil(),
            indexer_name: "indexer-a".to_string(),
            resolution,
            source,
            codec: Codec::H264,
            size_bytes: 1_000_000_000,
            seeders,
            leechers: 0,
            download_url: Some("https://example.test/dl".to_string()),
            magnet_uri: None,
            publish_date: Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap(),
            categories: vec![],
            score: 0,
        }
    }

    #[test]
    fn s1_movie_happy_path_prefers_highest_score_when_no_preference() {
        let candidates = vec![
            release("Dune.2021.1080p.WEB-DL.H264", Resolution::P1080, Source::WebDL, 120),
            release("Dune.2021.2160p.BluRay.HEVC", Resolution::P2160, Source::BluRay, 40),
            release("Dune.2021.720p.HDTV.H264", Resolution::P720, Source::Hdtv, 5),
        ];
        let result = select(&candidates, &SelectionConstraints::default());

        assert_eq!(result.releases.len(), 3);
        assert_eq!(result.winner.as_ref().unwrap().resolution, Resolution::P2160);
    }

    #[test]
    fn s2_quality_gate_filters_below_required_resolution() {
        let candidates = vec![release("Dune.2021.720p.HDTV.H264", Resolution::P720, Source::Hdtv, 5)];
        let constraints = SelectionConstraints {
            required_resolution: Some(Resolution::P1080),
            ..Default::default()
        };
        let result = select(&candidates, &constraints);

        assert!(result.winner.is_none());
        assert!(result.releases.is_empty());
        assert_eq!(result.raw.len(), 1, "raw list retains the pre-constraint candidate");
    }

    #[test]
    fn dedup_keeps_highest_scoring_of_same_normalized_title() {
        let mut low = release("Dune 2021 720p", Resolution::P720, Source::WebRip, 1);
        let mut high = release("Dune.2021.720p", Resolution::P720, Source::Remux, 1);
        low.title = "Dune 2021 720p".to_string();
        high.title = "Dune.2021.720p".to_string();

        let result = select(&[low, high], &SelectionConstraints::default());
        assert_eq!(result.raw.len(), 1);
        assert_eq!(result.raw[0].source, Source::Remux);
    }

    #[test]
    fn selection_is_pure() {
        let candidates = vec![
            release("A.2021.1080p", Resolution::P1080, Source::WebDL, 10),
            release("B.2021.2160p", Resolution::P2160, Source::BluRay, 3),
        ];
        let constraints = SelectionConstraints::default();

        let first = select(&candidates, &constraints);
        let second = select(&candidates, &constraints);

        assert_eq!(first.winner.map(|r| r.title), second.winner.map(|r| r.title));
        assert_eq!(
            first.releases.iter().map(|r| r.score).collect::<Vec<_>>(),
            second.releases.iter().map(|r| r.score).collect::<Vec<_>>()
        );
    }

    #[test]
    fn sample_releases_are_penalized_below_legitimate_ones() {
        let candidates = vec![
            release("Dune.2021.1080p.SAMPLE", Resolution::P1080, Source::WebDL, 50),
            release("Dune.2021.720p", Resolution::P720, Source::Hdtv, 5),
        ];
        let result = select(&candidates, &SelectionConstraints::default());
        assert_eq!(result.winner.unwrap().resolution, Resolution::P720);
    }

    #[test]
    fn preferred_resolution_overrides_top_score_when_available() {
        let candidates = vec![
            release("X.2021.2160p", Resolution::P2160, Source::BluRay, 10),
            release("X.2021.1080p", Resolution::P1080, Source::Remux, 10),
        ];
        let constraints = SelectionConstraints {
            preferred_resolution: Some(Resolution::P1080),
            ..Default::default()
        };
        let result = select(&candidates, &constraints);
        assert_eq!(result.winner.unwrap().resolution, Resolution::P1080);
    }
}
