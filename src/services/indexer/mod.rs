//! The Indexer contract consumed by the core (spec.md §6), and the
//! Indexer Fanout that queries every configured indexer in parallel
//! (spec.md §4.5). Styled on the teacher's (legacy) `Indexer` trait shape:
//! `id()`/`name()`/`can_handle_query()`/`search()`.

pub mod fanout;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::services::quality::Release;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Movie,
    Series,
}

#[derive(Debug, Clone, Default)]
pub struct IndexerQuery {
    pub kind: Option<MediaKind>,
    pub external_ids: Vec<String>,
    pub query: String,
    pub year: Option<i32>,
    pub season: Option<i32>,
    pub episode: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct IndexerSearchResult {
    pub releases: Vec<Release>,
    /// Indexers the fanout attempted to query (after `can_handle_query` filtering).
    pub queried: usize,
    /// Of `queried`, the count that errored, timed out, or panicked.
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Narrow contract an indexer protocol adapter must satisfy (spec.md §6).
/// Concrete adapters (Torznab/Newznab XML, private-tracker login+scrape)
/// are out of scope for the core; only deterministic mocks ship here.
#[async_trait]
pub trait Indexer: Send + Sync {
    fn id(&self) -> Uuid;
    fn name(&self) -> &str;
    fn can_handle_query(&self, query: &IndexerQuery) -> bool;
    async fn search(&self, query: &IndexerQuery) -> anyhow::Result<Vec<Release>>;
}
