//! IRC announce listener. Connects to a single announce channel, runs a
//! line-based protocol loop via `tokio_util`'s `LinesCodec`, and reconnects
//! with the same `backoff`-crate exponential policy the teacher's rate
//! limiter uses for upstream retries (spec.md §4.7).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;

use super::{AnnounceMatcher, AnnouncedRelease};

/// Config carved out of the full `Config` so a listener can be constructed
/// without cloning unrelated RSS/job-queue settings.
#[derive(Debug, Clone)]
pub struct IrcConfig {
    pub server: String,
    pub port: u16,
    pub nickname: String,
    pub channels: Vec<String>,
    pub reconnect: bool,
    pub reconnect_delay: Duration,
    pub reconnect_max_retries: u32,
    pub download_base_url: String,
}

impl From<&Config> for IrcConfig {
    fn from(c: &Config) -> Self {
        Self {
            server: c.irc_server.clone(),
            port: c.irc_port,
            nickname: c.irc_nickname.clone(),
            channels: c.irc_channels.clone(),
            reconnect: c.irc_reconnect,
            reconnect_delay: c.irc_reconnect_delay,
            reconnect_max_retries: c.irc_reconnect_max_retries,
            download_base_url: c.irc_download_base_url.clone(),
        }
    }
}

pub struct IrcListener {
    config: IrcConfig,
    matcher: Arc<AnnounceMatcher>,
    indexer_id: Uuid,
}

impl IrcListener {
    pub fn new(config: IrcConfig, matcher: Arc<AnnounceMatcher>) -> Self {
        Self { config, matcher, indexer_id: Uuid::nil() }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.reconnect_delay,
            multiplier: 2.0,
            max_interval: self.config.reconnect_delay * 5,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Runs forever (until the task is aborted), reconnecting on every
    /// disconnect up to `reconnect_max_retries` when `reconnect` is set.
    pub async fn run(&self) {
        let mut attempts: u32 = 0;
        let mut backoff = self.backoff();

        loop {
            match self.connect_and_listen().await {
                Ok(()) => {
                    info!(server = %self.config.server, "irc connection closed cleanly");
                }
                Err(err) => {
                    warn!(server = %self.config.server, error = %err, "irc connection failed");
                }
            }

            if !self.config.reconnect {
                return;
            }
            attempts += 1;
            if attempts > self.config.reconnect_max_retries {
                warn!(server = %self.config.server, attempts, "irc reconnect retries exhausted, giving up");
                return;
            }
            let delay = backoff.next_backoff().unwrap_or(self.config.reconnect_delay);
            info!(server = %self.config.server, attempt = attempts, delay_ms = delay.as_millis(), "reconnecting to irc");
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect_and_listen(&self) -> Result<()> {
        if self.config.server.is_empty() {
            return Err(anyhow!("irc server not configured"));
        }

        let addr = format!("{}:{}", self.config.server, self.config.port);
        let stream = TcpStream::connect(&addr).await.with_context(|| format!("connecting to {addr}"))?;
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(8192));

        send_line(&mut write_half, &format!("NICK {}", self.config.nickname)).await?;
        send_line(&mut write_half, &format!("USER {} 0 * :harvestd announce listener", self.config.nickname)).await?;

        let mut joined = false;

        while let Some(line) = lines.next().await {
            let line = line.context("irc line decode error")?;
            debug!(line = %line, "irc recv");

            if let Some(server) = line.strip_prefix("PING ") {
                send_line(&mut write_half, &format!("PONG {server}")).await?;
                continue;
            }

            if !joined && line.contains(" 001 ") {
                for channel in &self.config.channels {
                    send_line(&mut write_half, &format!("JOIN {channel}")).await?;
                }
                joined = true;
                continue;
            }

            if let Some(announced) = self.parse_privmsg(&line) {
                match self.matcher.try_match(&announced).await {
                    Ok(true) => info!(title = %announced.title, "irc announce matched a waiting request"),
                    Ok(false) => {}
                    Err(err) => warn!(error = %err, "irc announce match pipeline failed"),
                }
            }
        }

        Ok(())
    }

    /// Parses a `PRIVMSG #channel :<announce text>` line into a release.
    /// The announce grammar is `<title> | <rss-key>/<torrent-id>` when the
    /// bot includes an explicit tracker path, or a bare title otherwise —
    /// in which case the download URL is synthesized from
    /// `download_base_url` and the URL-encoded title (spec.md §4.7).
    fn parse_privmsg(&self, line: &str) -> Option<AnnouncedRelease> {
        parse_announce_line(line, &self.config.download_base_url, self.indexer_id)
    }
}

async fn send_line(write_half: &mut tokio::net::tcp::OwnedWriteHalf, line: &str) -> Result<()> {
    write_half.write_all(line.as_bytes()).await?;
    write_half.write_all(b"\r\n").await?;
    Ok(())
}

/// The announce grammar is `<title> | <rss-key>/<torrent-id>` when the bot
/// includes an explicit tracker path, or a bare title otherwise — in which
/// case the download URL is synthesized from `download_base_url` and the
/// URL-encoded title (spec.md §4.7). Free function so it can be unit
/// tested without standing up a full listener.
fn parse_announce_line(line: &str, download_base_url: &str, indexer_id: Uuid) -> Option<AnnouncedRelease> {
    let rest = line.splitn(2, "PRIVMSG ").nth(1)?;
    let (_channel, text) = rest.split_once(" :")?;

    let (title, tracker_path) = match text.split_once('|') {
        Some((title, path)) => (title.trim().to_string(), Some(path.trim().to_string())),
        None => (text.trim().to_string(), None),
    };
    if title.is_empty() {
        return None;
    }

    let download_url = match tracker_path {
        Some(path) if !download_base_url.is_empty() => {
            Some(format!("{}/{}", download_base_url.trim_end_matches('/'), path))
        }
        Some(path) => Some(path),
        None if !download_base_url.is_empty() => {
            Some(format!("{}/{}", download_base_url.trim_end_matches('/'), urlencoding::encode(&title)))
        }
        None => None,
    };

    Some(AnnouncedRelease {
        title,
        download_url,
        magnet_uri: None,
        size_bytes: 0,
        seeders: 0,
        leechers: 0,
        indexer_name: "irc".to_string(),
        indexer_id,
        publish_date: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE_URL: &str = "https://tracker.example/dl";

    #[test]
    fn parses_announce_with_explicit_tracker_path() {
        let announced = parse_announce_line(
            "PRIVMSG #announce :Dune.2021.1080p.BluRay.x265 | rsskey123/998877",
            BASE_URL,
            Uuid::nil(),
        )
        .unwrap();
        assert_eq!(announced.title, "Dune.2021.1080p.BluRay.x265");
        assert_eq!(announced.download_url.unwrap(), "https://tracker.example/dl/rsskey123/998877");
    }

    #[test]
    fn synthesizes_url_from_bare_title() {
        let announced =
            parse_announce_line("PRIVMSG #announce :Chicago Fire S14E08 1080p WEB", BASE_URL, Uuid::nil()).unwrap();
        assert!(announced.download_url.unwrap().starts_with("https://tracker.example/dl/Chicago"));
    }

    #[test]
    fn non_privmsg_lines_are_ignored() {
        assert!(parse_announce_line(":irc.example.net 001 harvestd :Welcome", BASE_URL, Uuid::nil()).is_none());
    }
}
