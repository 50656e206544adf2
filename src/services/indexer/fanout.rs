//! Indexer Fanout: queries every enabled indexer concurrently with a
//! per-indexer timeout, aggregating partial successes (spec.md §4.5).
//! Grounded on the teacher's `indexer/manager.rs` concurrent
//! `tokio::spawn`-per-indexer search pattern.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::services::indexer::{Indexer, IndexerQuery, IndexerSearchResult};

/// Per-indexer search timeout (spec.md §4.5).
pub const INDEXER_TIMEOUT: Duration = Duration::from_secs(30);

pub struct IndexerFanout {
    indexers: Vec<Arc<dyn Indexer>>,
}

impl IndexerFanout {
    pub fn new(indexers: Vec<Arc<dyn Indexer>>) -> Self {
        Self { indexers }
    }

    /// Queries every indexer able to handle `query` in parallel. Each call
    /// is bounded by [`INDEXER_TIMEOUT`]; a timeout or adapter error is
    /// recorded in `errors` without failing the overall fanout.
    pub async fn search(&self, query: &IndexerQuery) -> IndexerSearchResult {
        let candidates: Vec<_> = self
            .indexers
            .iter()
            .filter(|indexer| indexer.can_handle_query(query))
            .cloned()
            .collect();

        let queried = candidates.len();
        let mut handles = Vec::with_capacity(candidates.len());
        for indexer in candidates {
            let query = query.clone();
            handles.push(tokio::spawn(async move {
                let name = indexer.name().to_string();
                let result = tokio::time::timeout(INDEXER_TIMEOUT, indexer.search(&query)).await;
                (name, result)
            }));
        }

        let mut releases = Vec::new();
        let mut errors = Vec::new();
        let mut failed = 0;

        for handle in handles {
            match handle.await {
                Ok((name, Ok(Ok(found)))) => releases.extend(found),
                Ok((name, Ok(Err(err)))) => {
                    warn!(indexer = %name, error = %err, "indexer search failed");
                    errors.push(format!("{name}: {err}"));
                    failed += 1;
                }
                Ok((name, Err(_elapsed))) => {
                    warn!(indexer = %name, "indexer search timed out");
                    errors.push(format!("{name}: timed out after {INDEXER_TIMEOUT:?}"));
                    failed += 1;
                }
                Err(join_err) => {
                    warn!(error = %join_err, "indexer search task panicked");
                    errors.push(format!("indexer task panicked: {join_err}"));
                    failed += 1;
                }
            }
        }

        IndexerSearchResult { releases, queried, failed, errors }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::quality::{Codec, Resolution, Source};
    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    struct MockIndexer {
        id: Uuid,
        name: String,
        releases: Vec<crate::services::quality::Release>,
        fail: bool,
    }

    #[async_trait]
    impl Indexer for MockIndexer {
        fn id(&self) -> Uuid {
            self.id
        }
        fn name(&self) -> &str {
            &self.name
        }
        fn can_handle_query(&self, _query: &IndexerQuery) -> bool {
            true
        }
        async fn search(&self, _query: &IndexerQuery) -> anyhow::Result<Vec<crate::services::quality::Release>> {
            if self.fail {
                anyhow::bail!("upstream unavailable")
            }
            Ok(self.releases.clone())
        }
    }

    fn sample_release(title: &str) -> crate::services::quality::Release {
        crate::services::quality::Release {
            title: title.to_string(),
            indexer_id: Uuid::nil(),
            indexer_name: "mock".to_string(),
            resolution: Resolution::P1080,
            source: Source::WebDL,
            codec: Codec::H264,
            size_bytes: 1,
            seeders: 1,
            leechers: 0,
            download_url: Some("https://example.test".to_string()),
            magnet_uri: None,
            publish_date: Utc::now(),
            categories: vec![],
            score: 0,
        }
    }

    #[tokio::test]
    async fn aggregates_partial_failures_without_failing_whole_fanout() {
        let good = Arc::new(MockIndexer {
            id: Uuid::new_v4(),
            name: "good".to_string(),
            releases: vec![sample_release("Good.Release")],
            fail: false,
        });
        let bad = Arc::new(MockIndexer {
            id: Uuid::new_v4(),
            name: "bad".to_string(),
            releases: vec![],
            fail: true,
        });

        let fanout = IndexerFanout::new(vec![good, bad]);
        let result = fanout.search(&IndexerQuery::default()).await;

        assert_eq!(result.releases.len(), 1);
        assert_eq!(result.queried, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("bad"));
    }

    #[tokio::test]
    async fn skips_indexers_that_cannot_handle_the_query() {
        struct Picky;
        #[async_trait]
        impl Indexer for Picky {
            fn id(&self) -> Uuid {
                Uuid::nil()
            }
            fn name(&self) -> &str {
                "picky"
            }
            fn can_handle_query(&self, _query: &IndexerQuery) -> bool {
                false
            }
            async fn search(&self, _query: &IndexerQuery) -> anyhow::Result<Vec<crate::services::quality::Release>> {
                panic!("should never be called");
            }
        }

        let fanout = IndexerFanout::new(vec![Arc::new(Picky)]);
        let result = fanout.search(&IndexerQuery::default()).await;
        assert!(result.releases.is_empty());
        assert_eq!(result.queried, 0, "picky never passes can_handle_query, so it's never counted as queried");
        assert_eq!(result.failed, 0);
        assert!(result.errors.is_empty());
    }
}
