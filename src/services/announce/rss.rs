//! RSS announce poller, styled on the teacher's `services/rss.rs` quick-xml
//! item parser. Each configured feed is polled on a fixed interval; new
//! items (tracked by a bounded LRU of seen guids) are run through the
//! shared match pipeline.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{AnnounceMatcher, AnnouncedRelease};

/// Bound on the seen-guid set per feed (spec.md §4.7).
const SEEN_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Default)]
struct RssItemBuilder {
    guid: Option<String>,
    title: Option<String>,
    link: Option<String>,
    pub_date: Option<String>,
    size_bytes: Option<i64>,
    seeders: Option<i64>,
    leechers: Option<i64>,
}

#[derive(Debug, Clone)]
struct ParsedRssItem {
    guid: String,
    title: String,
    link: String,
    pub_date: Option<DateTime<Utc>>,
    size_bytes: i64,
    seeders: i64,
    leechers: i64,
}

/// A fixed-capacity set of recently-seen guids, oldest evicted first.
struct SeenGuids {
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenGuids {
    fn new(capacity: usize) -> Self {
        Self { order: VecDeque::with_capacity(capacity), capacity }
    }

    /// Returns `true` if this is the first time the guid has been seen.
    fn insert(&mut self, guid: String) -> bool {
        if self.order.contains(&guid) {
            return false;
        }
        if self.order.len() >= self.capacity {
            self.order.pop_front();
        }
        self.order.push_back(guid);
        true
    }
}

pub struct RssPoller {
    client: Client,
    feed_urls: Vec<String>,
    matcher: Arc<AnnounceMatcher>,
    seen: Mutex<SeenGuids>,
    indexer_id: Uuid,
}

impl RssPoller {
    pub fn new(feed_urls: Vec<String>, matcher: Arc<AnnounceMatcher>) -> Self {
        let client = Client::builder()
            .user_agent("harvestd/0.1")
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("failed to build rss http client");

        Self {
            client,
            feed_urls,
            matcher,
            seen: Mutex::new(SeenGuids::new(SEEN_CAPACITY)),
            indexer_id: Uuid::nil(),
        }
    }

    /// Polled by the `Scheduler` at `rss.pollInterval`; fetches every
    /// configured feed and feeds unseen items through the matcher.
    pub async fn poll_tick(&self) -> Result<()> {
        for url in &self.feed_urls {
            if let Err(err) = self.poll_feed(url).await {
                warn!(feed = %url, error = %err, "rss feed poll failed");
            }
        }
        Ok(())
    }

    async fn poll_feed(&self, url: &str) -> Result<()> {
        let response = self.client.get(url).send().await.context("failed to fetch rss feed")?;
        if !response.status().is_success() {
            anyhow::bail!("rss feed returned status {}", response.status());
        }
        let body = response.text().await.context("failed to read rss feed body")?;
        let items = parse_feed(&body)?;

        let mut matched = 0;
        for item in items {
            let is_new = self.seen.lock().insert(item.guid.clone());
            if !is_new {
                continue;
            }
            let announced = AnnouncedRelease {
                title: item.title,
                download_url: Some(item.link),
                magnet_uri: None,
                size_bytes: item.size_bytes,
                seeders: item.seeders,
                leechers: item.leechers,
                indexer_name: "rss".to_string(),
                indexer_id: self.indexer_id,
                publish_date: item.pub_date.unwrap_or_else(Utc::now),
            };
            if self.matcher.try_match(&announced).await? {
                matched += 1;
            }
        }

        debug!(feed = %url, matched, "rss feed poll complete");
        Ok(())
    }
}

fn parse_feed(content: &str) -> Result<Vec<ParsedRssItem>> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut items = Vec::new();
    let mut current: Option<RssItemBuilder> = None;
    let mut current_tag = String::new();
    let mut in_item = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                current_tag = tag.clone();
                if tag == "item" {
                    in_item = true;
                    current = Some(RssItemBuilder::default());
                }
            }
            Ok(Event::End(ref e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if tag == "item" {
                    in_item = false;
                    if let Some(builder) = current.take() {
                        if let Some(item) = build_item(builder) {
                            items.push(item);
                        }
                    }
                }
                current_tag.clear();
            }
            Ok(Event::Text(ref e)) | Ok(Event::CData(ref e)) => {
                if in_item {
                    if let Some(builder) = current.as_mut() {
                        let text = e.unescape().map(|c| c.into_owned()).unwrap_or_default();
                        apply_field(builder, &current_tag, text);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => {
                warn!(error = ?err, "error parsing rss xml");
                break;
            }
            _ => {}
        }
    }

    info!(count = items.len(), "parsed rss feed items");
    Ok(items)
}

fn apply_field(builder: &mut RssItemBuilder, tag: &str, text: String) {
    match tag {
        "title" => builder.title = Some(text),
        "link" => builder.link = Some(text),
        "guid" => builder.guid = Some(text),
        "pubDate" => builder.pub_date = Some(text),
        "size" => builder.size_bytes = text.parse().ok(),
        "seeders" => builder.seeders = text.parse().ok(),
        "peers" | "leechers" => builder.leechers = text.parse().ok(),
        _ => {}
    }
}

fn build_item(builder: RssItemBuilder) -> Option<ParsedRssItem> {
    let title = builder.title?;
    let link = builder.link?;
    let guid = builder.guid.unwrap_or_else(|| link.clone());
    Some(ParsedRssItem {
        guid,
        title,
        link,
        pub_date: builder.pub_date.as_deref().and_then(parse_rss_date),
        size_bytes: builder.size_bytes.unwrap_or(0),
        seeders: builder.seeders.unwrap_or(0),
        leechers: builder.leechers.unwrap_or(0),
    })
}

fn parse_rss_date(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    let formats = ["%a, %d %b %Y %H:%M:%S %z", "%Y-%m-%dT%H:%M:%S%z", "%Y-%m-%d %H:%M:%S"];
    for fmt in formats {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_items_and_skips_incomplete_entries() {
        let xml = r#"
        <rss version="2.0">
        <channel>
            <item>
                <title>Chicago Fire S14E08 1080p WEB h264-ETHEL</title>
                <link>https://example.com/download.php/12345/file.torrent</link>
                <guid>12345</guid>
                <pubDate>Thu, 08 Jan 2026 10:01:59 +0000</pubDate>
                <size>1548288000</size>
                <seeders>42</seeders>
            </item>
            <item>
                <title>missing link, skipped</title>
            </item>
        </channel>
        </rss>
        "#;
        let items = parse_feed(xml).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].guid, "12345");
        assert_eq!(items[0].seeders, 42);
    }

    #[test]
    fn seen_guids_evicts_oldest_past_capacity() {
        let mut seen = SeenGuids::new(2);
        assert!(seen.insert("a".to_string()));
        assert!(seen.insert("b".to_string()));
        assert!(seen.insert("c".to_string()));
        assert!(seen.insert("a".to_string()), "a should have been evicted by the time c landed");
        assert!(!seen.insert("c".to_string()));
    }
}
