use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::types::{NewArticle, PublisherError, Result};

/// External collaborator that accepts finished articles.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Create the artifact, returning its id in the store.
    async fn publish(&self, article: &NewArticle) -> Result<String>;

    /// Best-effort cover image attachment; failures are logged, never fatal.
    async fn attach_cover_image(&self, artifact_id: &str, image_url: &str) -> Result<()>;
}

/// Generic JSON-over-HTTP content store client.
pub struct HttpContentStore {
    client: Client,
    endpoint: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct PublishResponse {
    id: String,
}

impl HttpContentStore {
    pub fn new(endpoint: String, token: String, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            endpoint,
            token,
        }
    }
}

#[async_trait]
impl ContentStore for HttpContentStore {
    async fn publish(&self, article: &NewArticle) -> Result<String> {
        let url = format!("{}/articles", self.endpoint);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(article)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PublisherError::Upstream(format!(
                "content store returned HTTP {}",
                status
            )));
        }

        let parsed: PublishResponse = response.json().await?;
        debug!("Published '{}' as artifact {}", article.title, parsed.id);
        Ok(parsed.id)
    }

    async fn attach_cover_image(&self, artifact_id: &str, image_url: &str) -> Result<()> {
        let url = format!("{}/articles/{}/cover", self.endpoint, artifact_id);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "image_url": image_url }))
            .send()
            .await?;

        if !response.status().is_success() {
            warn!(
                "Cover image attach failed for artifact {}: HTTP {}",
                artifact_id,
                response.status()
            );
        }
        Ok(())
    }
}

/// In-memory store for tests: records every published article and cover.
#[derive(Default)]
pub struct MemoryContentStore {
    articles: Mutex<Vec<NewArticle>>,
    covers: Mutex<Vec<(String, String)>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<NewArticle> {
        self.articles.lock().unwrap().clone()
    }

    pub fn published_count(&self) -> usize {
        self.articles.lock().unwrap().len()
    }

    pub fn covers(&self) -> Vec<(String, String)> {
        self.covers.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn publish(&self, article: &NewArticle) -> Result<String> {
        let mut articles = self.articles.lock().unwrap();
        articles.push(article.clone());
        Ok(format!("artifact-{}", articles.len()))
    }

    async fn attach_cover_image(&self, artifact_id: &str, image_url: &str) -> Result<()> {
        self.covers
            .lock()
            .unwrap()
            .push((artifact_id.to_string(), image_url.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_article() -> NewArticle {
        NewArticle {
            title: "T".into(),
            content_html: "<p>body</p>".into(),
            status: "draft".into(),
            author: "a".into(),
            category: "news".into(),
            language: None,
            source_link: "https://example.com/x".into(),
            published_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn memory_store_records_articles_and_covers() {
        let store = MemoryContentStore::new();

        let id = store.publish(&sample_article()).await.unwrap();
        assert_eq!(id, "artifact-1");
        assert_eq!(store.published_count(), 1);

        store
            .attach_cover_image(&id, "https://cdn.example.com/a.jpg")
            .await
            .unwrap();
        assert_eq!(store.covers().len(), 1);
    }
}
