use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::rate_limit::RateLimitState;
use crate::types::{GenerateRequest, GeneratedContent, PublisherError, Result};

/// External generation/translation service. The gateway owns HTTP-level
/// retry and surfaces throttling as a boolean the orchestrator polls before
/// dispatching, so a known outage window never burns job attempts.
#[async_trait]
pub trait ContentGateway: Send + Sync {
    fn is_configured(&self) -> bool;

    fn is_rate_limited(&self) -> bool;

    /// When the current throttle window ends, if one is active.
    fn rate_limited_until(&self) -> Option<chrono::DateTime<chrono::Utc>>;

    async fn generate(&self, request: &GenerateRequest) -> Result<GeneratedContent>;

    async fn translate(
        &self,
        title: &str,
        content_html: &str,
        target_language: &str,
    ) -> Result<GeneratedContent>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o".to_string(),
            timeout: Duration::from_secs(120),
            max_retries: 2,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// OpenAI-compatible chat-completions gateway.
pub struct OpenAiGateway {
    config: GatewayConfig,
    client: Client,
    rate_limit: Arc<RateLimitState>,
}

impl OpenAiGateway {
    pub fn new(config: GatewayConfig, rate_limit: Arc<RateLimitState>) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            config,
            client,
            rate_limit,
        }
    }

    async fn call_chat(&self, system: String, user: String) -> Result<String> {
        let url = format!("{}/chat/completions", self.config.endpoint);
        let body = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: 0.7,
        };

        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(60),
            max_elapsed_time: Some(Duration::from_secs(300)),
            ..Default::default()
        };

        let mut last_error: Option<PublisherError> = None;

        for attempt in 0..=self.config.max_retries {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .json(&body)
                .send()
                .await;

            match response {
                Ok(response) => {
                    let status = response.status();

                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        let seconds = response
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(60);
                        self.rate_limit.activate_for(seconds);
                        warn!("Gateway rate limited for {}s", seconds);
                        return Err(PublisherError::RateLimited { seconds });
                    }

                    if status.is_server_error() {
                        last_error = Some(PublisherError::Upstream(format!(
                            "gateway returned HTTP {}",
                            status
                        )));
                    } else if !status.is_success() {
                        return Err(PublisherError::Upstream(format!(
                            "gateway returned HTTP {}",
                            status
                        )));
                    } else {
                        let parsed: ChatResponse = response.json().await?;
                        let content = parsed
                            .choices
                            .into_iter()
                            .next()
                            .map(|c| c.message.content)
                            .unwrap_or_default();
                        if content.is_empty() {
                            return Err(PublisherError::Upstream(
                                "gateway returned an empty completion".to_string(),
                            ));
                        }
                        return Ok(content);
                    }
                }
                Err(e) => last_error = Some(PublisherError::Http(e)),
            }

            if attempt < self.config.max_retries {
                if let Some(delay) = backoff.next_backoff() {
                    warn!("Gateway attempt {} failed, retrying in {:?}", attempt + 1, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| PublisherError::Upstream("gateway request failed".to_string())))
    }
}

/// The gateway asks for a JSON object so titles survive transport; if the
/// model answers with prose anyway, the whole answer becomes the body.
fn parse_article(raw: &str, fallback_title: &str) -> GeneratedContent {
    #[derive(Deserialize)]
    struct Article {
        title: String,
        content: String,
    }

    let trimmed = raw.trim();
    let candidate = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end_matches("```").trim())
        .unwrap_or(trimmed);

    match serde_json::from_str::<Article>(candidate) {
        Ok(article) => GeneratedContent {
            title: article.title,
            content_html: article.content,
        },
        Err(_) => GeneratedContent {
            title: fallback_title.to_string(),
            content_html: trimmed.to_string(),
        },
    }
}

#[async_trait]
impl ContentGateway for OpenAiGateway {
    fn is_configured(&self) -> bool {
        !self.config.api_key.is_empty()
    }

    fn is_rate_limited(&self) -> bool {
        self.rate_limit.is_active()
    }

    fn rate_limited_until(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.rate_limit.active_until()
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<GeneratedContent> {
        let policy = &request.policy;

        let system = format!(
            "You write original long-form articles in HTML. Domain: {}. Angle: {}. \
             Target length: {} words. {} Respond with a JSON object: \
             {{\"title\": \"...\", \"content\": \"...\"}}.",
            policy.domain, policy.angle, policy.length, policy.instructions
        );

        let mut user = format!(
            "Write a complete article inspired by this headline and excerpt.\n\
             Headline: {}\nExcerpt: {}",
            request.title, request.excerpt
        );
        if request.extended {
            user.push_str(&format!(
                "\nThe previous draft was too short. Write a substantially longer, \
                 more detailed article of at least {} words.",
                policy.min_words
            ));
        }

        debug!("Generating content for '{}'", request.title);
        let raw = self.call_chat(system, user).await?;
        Ok(parse_article(&raw, &request.title))
    }

    async fn translate(
        &self,
        title: &str,
        content_html: &str,
        target_language: &str,
    ) -> Result<GeneratedContent> {
        let system = format!(
            "You translate articles into {}. Preserve HTML structure. Respond with \
             a JSON object: {{\"title\": \"...\", \"content\": \"...\"}}.",
            target_language
        );
        let user = format!("Title: {}\n\n{}", title, content_html);

        debug!("Translating '{}' into {}", title, target_language);
        let raw = self.call_chat(system, user).await?;
        Ok(parse_article(&raw, title))
    }
}

/// Scriptable gateway for tests: counts calls, can simulate throttling,
/// pops scripted responses before falling back to synthesized content.
pub struct MockGateway {
    configured: bool,
    rate_limited: AtomicBool,
    generate_calls: AtomicUsize,
    translate_calls: AtomicUsize,
    scripted: Mutex<VecDeque<GeneratedContent>>,
    default_words: usize,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            configured: true,
            rate_limited: AtomicBool::new(false),
            generate_calls: AtomicUsize::new(0),
            translate_calls: AtomicUsize::new(0),
            scripted: Mutex::new(VecDeque::new()),
            default_words: 800,
        }
    }

    pub fn unconfigured() -> Self {
        Self {
            configured: false,
            ..Self::new()
        }
    }

    /// Default word count for synthesized articles.
    pub fn with_default_words(mut self, words: usize) -> Self {
        self.default_words = words;
        self
    }

    pub fn set_rate_limited(&self, limited: bool) {
        self.rate_limited.store(limited, Ordering::SeqCst);
    }

    /// Queue an exact response to return from the next generate call.
    pub fn script_response(&self, response: GeneratedContent) {
        self.scripted.lock().unwrap().push_back(response);
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn translate_calls(&self) -> usize {
        self.translate_calls.load(Ordering::SeqCst)
    }

    fn synthesize(&self, title: &str) -> GeneratedContent {
        let body = vec!["lorem"; self.default_words].join(" ");
        GeneratedContent {
            title: format!("Generated: {}", title),
            content_html: format!("<p>{}</p>", body),
        }
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentGateway for MockGateway {
    fn is_configured(&self) -> bool {
        self.configured
    }

    fn is_rate_limited(&self) -> bool {
        self.rate_limited.load(Ordering::SeqCst)
    }

    fn rate_limited_until(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        if self.is_rate_limited() {
            Some(chrono::Utc::now() + chrono::Duration::seconds(60))
        } else {
            None
        }
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<GeneratedContent> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(scripted) = self.scripted.lock().unwrap().pop_front() {
            return Ok(scripted);
        }
        Ok(self.synthesize(&request.title))
    }

    async fn translate(
        &self,
        title: &str,
        content_html: &str,
        target_language: &str,
    ) -> Result<GeneratedContent> {
        self.translate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(GeneratedContent {
            title: format!("[{}] {}", target_language, title),
            content_html: content_html.to_string(),
        })
    }
}
