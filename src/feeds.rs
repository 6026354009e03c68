use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::Utc;
use feed_rs::parser;
use reqwest::Client;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::types::{FeedItem, PublisherError, Result};

/// External collaborator that turns a feed URL into normalized items.
#[async_trait]
pub trait FeedReader: Send + Sync {
    async fn fetch_items(&self, url: &str) -> Result<Vec<FeedItem>>;
}

/// HTTP + feed-rs implementation.
pub struct HttpFeedReader {
    client: Client,
    max_retries: u32,
}

impl HttpFeedReader {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .user_agent("feedpress/0.1")
            .timeout(timeout)
            .gzip(true)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            max_retries: 2,
        }
    }

    async fn fetch_body(&self, url: &str) -> Result<String> {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(30),
            max_elapsed_time: Some(Duration::from_secs(90)),
            ..Default::default()
        };

        let mut last_error: Option<PublisherError> = None;

        for attempt in 0..=self.max_retries {
            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.text().await?);
                    }
                    last_error = Some(PublisherError::Upstream(format!(
                        "HTTP {} fetching {}",
                        status, url
                    )));
                }
                Err(e) => last_error = Some(PublisherError::Http(e)),
            }

            if attempt < self.max_retries {
                if let Some(delay) = backoff.next_backoff() {
                    warn!("Feed fetch attempt {} failed for {}, retrying", attempt + 1, url);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| PublisherError::Upstream(format!("fetch failed: {}", url))))
    }
}

#[async_trait]
impl FeedReader for HttpFeedReader {
    async fn fetch_items(&self, url: &str) -> Result<Vec<FeedItem>> {
        let body = self.fetch_body(url).await?;

        let feed = parser::parse(body.as_bytes())
            .map_err(|e| PublisherError::Parse(format!("Failed to parse feed {}: {}", url, e)))?;

        let mut items = Vec::new();
        for entry in feed.entries {
            if let Some(item) = normalize_entry(entry) {
                items.push(item);
            }
        }

        debug!("Fetched {} items from {}", items.len(), url);
        Ok(items)
    }
}

/// Map one feed-rs entry to our item shape. Entries without a link are
/// dropped; entries without an id fall back to the link as their guid.
fn normalize_entry(entry: feed_rs::model::Entry) -> Option<FeedItem> {
    let link = entry.links.first()?.href.clone();

    let guid = if entry.id.is_empty() {
        link.clone()
    } else {
        entry.id.clone()
    };

    let title = entry
        .title
        .map(|t| t.content)
        .unwrap_or_else(|| "Untitled".to_string());

    let excerpt = entry.summary.map(|s| s.content).unwrap_or_default();

    let content = entry
        .content
        .and_then(|c| c.body)
        .unwrap_or_else(|| excerpt.clone());

    let author = entry
        .authors
        .first()
        .map(|a| a.name.clone())
        .unwrap_or_default();

    let published_at = entry
        .published
        .or(entry.updated)
        .map(|dt| dt.with_timezone(&Utc));

    Some(FeedItem {
        guid,
        title,
        content,
        excerpt,
        link,
        published_at,
        author,
    })
}

/// In-memory reader for tests and dry runs: serves canned items per URL.
#[derive(Default)]
pub struct StaticFeedReader {
    items: RwLock<HashMap<String, Vec<FeedItem>>>,
}

impl StaticFeedReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_items(&self, url: &str, items: Vec<FeedItem>) {
        self.items.write().await.insert(url.to_string(), items);
    }
}

#[async_trait]
impl FeedReader for StaticFeedReader {
    async fn fetch_items(&self, url: &str) -> Result<Vec<FeedItem>> {
        Ok(self
            .items
            .read()
            .await
            .get(url)
            .cloned()
            .unwrap_or_default())
    }
}
