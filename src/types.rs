use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// How often a source is checked for new items. Checking cadence is
/// independent of the one-post-per-day cap: a source checked hourly still
/// publishes at most once per calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckFrequency {
    Hourly,
    #[serde(rename = "twicedaily")]
    TwiceDaily,
    Daily,
}

impl CheckFrequency {
    pub fn interval(&self) -> Duration {
        match self {
            CheckFrequency::Hourly => Duration::hours(1),
            CheckFrequency::TwiceDaily => Duration::hours(12),
            CheckFrequency::Daily => Duration::hours(24),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckFrequency::Hourly => "hourly",
            CheckFrequency::TwiceDaily => "twicedaily",
            CheckFrequency::Daily => "daily",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hourly" => Some(CheckFrequency::Hourly),
            "twicedaily" | "twice-daily" => Some(CheckFrequency::TwiceDaily),
            "daily" => Some(CheckFrequency::Daily),
            _ => None,
        }
    }
}

/// A registered feed with its posting and content policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,
    pub feed_url: String,
    pub name: String,
    pub category: String,
    pub author: String,
    pub publish_status: String,
    pub enhance: bool,
    pub translate: bool,
    pub target_languages: Vec<String>,
    pub content_domain: String,
    pub content_angle: String,
    pub content_length: String,
    pub min_words: u32,
    pub custom_instructions: String,
    pub check_frequency: CheckFrequency,
    pub is_active: bool,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_post_date: Option<NaiveDate>,
    pub posts_today: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Source {
    /// Whether the source's cadence interval has elapsed since the last
    /// check. Never-checked sources are always due.
    pub fn should_check(&self, now: DateTime<Utc>) -> bool {
        match self.last_checked {
            None => true,
            Some(last) => now - last >= self.check_frequency.interval(),
        }
    }

    /// Whether this source needs the generation gateway at all.
    pub fn needs_gateway(&self) -> bool {
        self.enhance || self.translate
    }

    pub fn content_policy(&self) -> ContentPolicy {
        ContentPolicy {
            domain: self.content_domain.clone(),
            angle: self.content_angle.clone(),
            length: self.content_length.clone(),
            min_words: self.min_words,
            instructions: self.custom_instructions.clone(),
        }
    }
}

/// Fields accepted when registering a source; everything else starts at the
/// schema defaults.
#[derive(Debug, Clone)]
pub struct NewSource {
    pub feed_url: String,
    pub name: String,
    pub category: String,
    pub author: String,
    pub publish_status: String,
    pub enhance: bool,
    pub translate: bool,
    pub target_languages: Vec<String>,
    pub check_frequency: CheckFrequency,
    pub min_words: u32,
}

impl Default for NewSource {
    fn default() -> Self {
        Self {
            feed_url: String::new(),
            name: String::new(),
            category: String::new(),
            author: String::new(),
            publish_status: "draft".to_string(),
            enhance: true,
            translate: false,
            target_languages: Vec::new(),
            check_frequency: CheckFrequency::Daily,
            min_words: 600,
        }
    }
}

/// Content-shaping settings handed to the generation gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPolicy {
    pub domain: String,
    pub angle: String,
    pub length: String,
    pub min_words: u32,
    pub instructions: String,
}

/// One normalized feed entry as returned by the feed reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedItem {
    pub guid: String,
    pub title: String,
    pub content: String,
    pub excerpt: String,
    pub link: String,
    pub published_at: Option<DateTime<Utc>>,
    pub author: String,
}

/// The pipeline stages a job can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    FetchAndQueue,
    GenerateContent,
    TranslateContent,
    Publish,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::FetchAndQueue => "fetch_and_queue",
            JobKind::GenerateContent => "generate_content",
            JobKind::TranslateContent => "translate_content",
            JobKind::Publish => "publish",
        }
    }
}

/// Queue status of a job row. Completed jobs are deleted, so there is no
/// `done` variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InFlight,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InFlight => "in_flight",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "in_flight" => Some(JobStatus::InFlight),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// Typed job payload, one variant per stage. Serialized to the queue's
/// `data` column as tagged JSON so heterogeneous kinds share one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    FetchAndQueue,
    GenerateContent {
        item: FeedItem,
    },
    TranslateContent {
        item: FeedItem,
        target_language: String,
        enhanced: bool,
    },
    Publish {
        item: FeedItem,
        language: Option<String>,
        enhanced: bool,
        translated: bool,
    },
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::FetchAndQueue => JobKind::FetchAndQueue,
            JobPayload::GenerateContent { .. } => JobKind::GenerateContent,
            JobPayload::TranslateContent { .. } => JobKind::TranslateContent,
            JobPayload::Publish { .. } => JobKind::Publish,
        }
    }
}

/// A queued unit of pipeline work.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub source_id: i64,
    pub status: JobStatus,
    pub payload: JobPayload,
    pub priority: i64,
    pub attempts: i64,
    pub max_attempts: i64,
    pub last_error: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }
}

/// Aggregate queue counters for the operator surface.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub in_flight: i64,
    pub failed: i64,
    pub total: i64,
}

/// Request handed to the generation gateway.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub title: String,
    pub excerpt: String,
    pub policy: ContentPolicy,
    /// Set for the single bounded regeneration after a too-short first draft.
    pub extended: bool,
}

/// What the gateway returns for both generation and translation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedContent {
    pub title: String,
    pub content_html: String,
}

/// A finished article handed to the content store.
#[derive(Debug, Clone, Serialize)]
pub struct NewArticle {
    pub title: String,
    pub content_html: String,
    pub status: String,
    pub author: String,
    pub category: String,
    pub language: Option<String>,
    pub source_link: String,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum PublisherError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Feed parse error: {0}")]
    Parse(String),

    #[error("Source not found: {id}")]
    SourceNotFound { id: i64 },

    #[error("Job not found: {id}")]
    JobNotFound { id: i64 },

    #[error("Unknown or missing source for enqueue: {id}")]
    InvalidSource { id: i64 },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Rate limited for {seconds} seconds")]
    RateLimited { seconds: u64 },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    General(String),
}

pub type Result<T> = std::result::Result<T, PublisherError>;
