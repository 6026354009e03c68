use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::content;
use crate::feeds::FeedReader;
use crate::gateway::ContentGateway;
use crate::ledger::{DedupLedger, ProcessedMeta};
use crate::publisher::ContentStore;
use crate::queue::JobQueue;
use crate::registry::SourceRegistry;
use crate::types::{
    FeedItem, GenerateRequest, Job, JobKind, JobPayload, NewArticle, PublisherError, Result,
};

pub const FETCH_PRIORITY: i64 = 10;
pub const GENERATE_PRIORITY: i64 = 9;
pub const TRANSLATE_PRIORITY: i64 = 8;
pub const PUBLISH_PRIORITY: i64 = 7;

/// Priority for operator-requested immediate checks, ahead of scheduled work.
pub const IMMEDIATE_PRIORITY: i64 = 12;

/// Absolute floor for publishing, independent of any source policy. Keeps a
/// degraded upstream call from producing near-empty artifacts.
pub const MIN_PUBLISH_WORDS: usize = 50;

/// The full pipeline shape as data: which stages each stage may enqueue.
/// The dispatcher refuses anything a handler requests outside this table.
pub const STAGE_GRAPH: &[(JobKind, &[JobKind])] = &[
    (JobKind::FetchAndQueue, &[JobKind::GenerateContent, JobKind::Publish]),
    (JobKind::GenerateContent, &[JobKind::TranslateContent, JobKind::Publish]),
    (JobKind::TranslateContent, &[JobKind::Publish]),
    (JobKind::Publish, &[]),
];

pub fn allowed_next(kind: JobKind) -> &'static [JobKind] {
    STAGE_GRAPH
        .iter()
        .find(|(from, _)| *from == kind)
        .map(|(_, next)| *next)
        .unwrap_or(&[])
}

/// A follow-on stage a handler wants enqueued. The dispatcher owns the
/// actual enqueue and always uses the current job's source id.
#[derive(Debug)]
pub struct FollowOn {
    pub payload: JobPayload,
    pub priority: i64,
}

/// What a stage handler decided.
#[derive(Debug)]
pub enum StageOutcome {
    /// Enqueue these follow-on stages and complete the job.
    Advance(Vec<FollowOn>),
    /// Terminal stage finished; complete the job.
    Done,
    /// Nothing to do this cycle; complete the job without side effects.
    Skip(&'static str),
    /// Gateway throttled: return to pending without burning the attempt.
    Defer(DateTime<Utc>),
}

/// How one leased job ended, for drain accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobResult {
    Completed,
    Skipped,
    Deferred,
    Failed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DrainSummary {
    pub leased: usize,
    pub completed: usize,
    pub skipped: usize,
    pub deferred: usize,
    pub failed: usize,
}

/// Consumes leased jobs, runs the stage for their kind, and chains the next
/// stage. Failures are isolated per job; nothing here can take down the
/// drain loop.
pub struct Orchestrator {
    registry: SourceRegistry,
    ledger: DedupLedger,
    queue: JobQueue,
    feed_reader: Arc<dyn FeedReader>,
    gateway: Arc<dyn ContentGateway>,
    content_store: Arc<dyn ContentStore>,
}

impl Orchestrator {
    pub fn new(
        db: SqlitePool,
        feed_reader: Arc<dyn FeedReader>,
        gateway: Arc<dyn ContentGateway>,
        content_store: Arc<dyn ContentStore>,
    ) -> Self {
        Self {
            registry: SourceRegistry::new(db.clone()),
            ledger: DedupLedger::new(db.clone()),
            queue: JobQueue::new(db),
            feed_reader,
            gateway,
            content_store,
        }
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &DedupLedger {
        &self.ledger
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Enqueue a fetch-and-queue job for one source.
    pub async fn enqueue_check(&self, source_id: i64, priority: i64) -> Result<i64> {
        self.queue
            .enqueue(source_id, &JobPayload::FetchAndQueue, priority)
            .await
    }

    /// Lease one batch and run every job in it. Generation calls are slow
    /// blocking I/O, so jobs run sequentially within the small batch.
    pub async fn drain(&self, batch_size: i64) -> Result<DrainSummary> {
        let jobs = self.queue.lease_batch(batch_size).await?;

        let mut summary = DrainSummary {
            leased: jobs.len(),
            ..DrainSummary::default()
        };

        for job in jobs {
            match self.run_job(&job).await {
                JobResult::Completed => summary.completed += 1,
                JobResult::Skipped => summary.skipped += 1,
                JobResult::Deferred => summary.deferred += 1,
                JobResult::Failed => summary.failed += 1,
            }
        }

        Ok(summary)
    }

    /// Run one leased job to its queue transition.
    pub async fn run_job(&self, job: &Job) -> JobResult {
        let kind = job.kind();

        let outcome = match self.execute_stage(job).await {
            Ok(outcome) => outcome,
            Err(PublisherError::RateLimited { seconds }) => {
                StageOutcome::Defer(Utc::now() + Duration::seconds(seconds as i64))
            }
            Err(e @ PublisherError::SourceNotFound { .. })
            | Err(e @ PublisherError::JobNotFound { .. }) => {
                warn!("Job {} ({}) aborted: {}", job.id, kind.as_str(), e);
                return self.finish_failed(job, &e.to_string(), true).await;
            }
            Err(e) => {
                warn!("Job {} ({}) failed: {}", job.id, kind.as_str(), e);
                return self.finish_failed(job, &e.to_string(), false).await;
            }
        };

        match outcome {
            StageOutcome::Advance(followons) => {
                for followon in &followons {
                    if !allowed_next(kind).contains(&followon.payload.kind()) {
                        let message = format!(
                            "illegal stage transition {} -> {}",
                            kind.as_str(),
                            followon.payload.kind().as_str()
                        );
                        error!("Job {}: {}", job.id, message);
                        return self.finish_failed(job, &message, true).await;
                    }
                }

                for followon in followons {
                    if let Err(e) = self
                        .queue
                        .enqueue(job.source_id, &followon.payload, followon.priority)
                        .await
                    {
                        error!("Job {}: failed to enqueue follow-on: {}", job.id, e);
                        return self.finish_failed(job, &e.to_string(), false).await;
                    }
                }

                self.finish_completed(job).await
            }
            StageOutcome::Done => self.finish_completed(job).await,
            StageOutcome::Skip(reason) => {
                debug!("Job {} ({}) skipped: {}", job.id, kind.as_str(), reason);
                if let Err(e) = self.queue.complete(job.id).await {
                    error!("Job {}: completion bookkeeping failed: {}", job.id, e);
                    return JobResult::Failed;
                }
                JobResult::Skipped
            }
            StageOutcome::Defer(until) => {
                info!(
                    "Job {} ({}) deferred until {} (gateway throttled)",
                    job.id,
                    kind.as_str(),
                    until
                );
                if let Err(e) = self.queue.defer(job.id, until).await {
                    error!("Job {}: defer bookkeeping failed: {}", job.id, e);
                    return JobResult::Failed;
                }
                JobResult::Deferred
            }
        }
    }

    async fn finish_completed(&self, job: &Job) -> JobResult {
        if let Err(e) = self.queue.complete(job.id).await {
            error!("Job {}: completion bookkeeping failed: {}", job.id, e);
            return JobResult::Failed;
        }
        JobResult::Completed
    }

    async fn finish_failed(&self, job: &Job, message: &str, terminal: bool) -> JobResult {
        let result = if terminal {
            self.queue.fail_terminal(job.id, message).await
        } else {
            self.queue.fail(job.id, message).await
        };
        if let Err(e) = result {
            error!("Job {}: failure bookkeeping failed: {}", job.id, e);
        }
        JobResult::Failed
    }

    async fn execute_stage(&self, job: &Job) -> Result<StageOutcome> {
        match &job.payload {
            JobPayload::FetchAndQueue => self.fetch_and_queue(job).await,
            JobPayload::GenerateContent { item } => self.generate_content(job, item).await,
            JobPayload::TranslateContent {
                item,
                target_language,
                enhanced,
            } => {
                self.translate_content(job, item, target_language, *enhanced)
                    .await
            }
            JobPayload::Publish {
                item,
                language,
                enhanced,
                translated,
            } => {
                self.publish(job, item, language.as_deref(), *enhanced, *translated)
                    .await
            }
        }
    }

    /// Fetch the feed and queue AT MOST ONE unprocessed item; never creating
    /// more than one downstream job per check is the cheap half of the
    /// one-post-per-day cap. Feed errors mean "no items this cycle".
    async fn fetch_and_queue(&self, job: &Job) -> Result<StageOutcome> {
        let source = self.registry.get_source(job.source_id).await?;

        if !source.is_active {
            return Ok(StageOutcome::Skip("source is paused"));
        }
        if self.ledger.has_posted_today(source.id).await? {
            return Ok(StageOutcome::Skip("source already posted today"));
        }

        let items = match self.feed_reader.fetch_items(&source.feed_url).await {
            Ok(items) => items,
            Err(e) => {
                warn!("Feed fetch failed for source {}: {}", source.id, e);
                self.registry.record_error(source.id, &e.to_string()).await?;
                self.registry.touch_checked(source.id, Utc::now()).await?;
                return Ok(StageOutcome::Skip("feed unavailable this cycle"));
            }
        };

        self.registry.touch_checked(source.id, Utc::now()).await?;

        // First unprocessed item in feed order; deterministic for a given
        // feed document.
        for item in items {
            if self.ledger.is_processed(source.id, &item.guid).await? {
                continue;
            }

            info!(
                "Source {}: queueing item '{}' ({})",
                source.id, item.title, item.guid
            );

            // The first downstream stage rides at the same priority tier
            // whether or not the gateway is involved.
            let followon = if source.needs_gateway() {
                FollowOn {
                    payload: JobPayload::GenerateContent { item },
                    priority: GENERATE_PRIORITY,
                }
            } else {
                FollowOn {
                    payload: JobPayload::Publish {
                        item,
                        language: None,
                        enhanced: false,
                        translated: false,
                    },
                    priority: GENERATE_PRIORITY,
                }
            };
            return Ok(StageOutcome::Advance(vec![followon]));
        }

        Ok(StageOutcome::Skip("no unprocessed items"))
    }

    /// Generate an article from the item's headline and excerpt, then fan
    /// out translation jobs or hand off to publish.
    ///
    /// The throttle check happens BEFORE any gateway call so a known outage
    /// window defers the job instead of consuming an attempt. A too-short
    /// draft gets exactly one regeneration with a longer-form directive.
    async fn generate_content(&self, job: &Job, item: &FeedItem) -> Result<StageOutcome> {
        let source = self.registry.get_source(job.source_id).await?;

        let wants_generation = source.enhance && self.gateway.is_configured();

        if wants_generation && self.gateway.is_rate_limited() {
            return Ok(StageOutcome::Defer(self.deferral_deadline()));
        }

        let (item, enhanced) = if !wants_generation {
            if source.enhance {
                warn!(
                    "Source {}: gateway not configured, passing item through unenhanced",
                    source.id
                );
            }
            (item.clone(), false)
        } else {
            let policy = source.content_policy();
            let request = GenerateRequest {
                title: item.title.clone(),
                excerpt: excerpt_of(item),
                policy: policy.clone(),
                extended: false,
            };

            let mut generated = self.gateway.generate(&request).await?;
            let mut words = content::word_count(&generated.content_html);

            if words < policy.min_words as usize {
                info!(
                    "Source {}: draft has {} words, below floor {}; regenerating once",
                    source.id, words, policy.min_words
                );
                let retry = GenerateRequest {
                    extended: true,
                    ..request
                };
                generated = self.gateway.generate(&retry).await?;
                words = content::word_count(&generated.content_html);

                if words < policy.min_words as usize {
                    return Err(PublisherError::Validation(format!(
                        "generated content below quality floor after regeneration: {} < {} words",
                        words, policy.min_words
                    )));
                }
            }

            let mut updated = item.clone();
            updated.title = generated.title;
            updated.content = generated.content_html;
            (updated, true)
        };

        if source.translate && !source.target_languages.is_empty() {
            let followons = source
                .target_languages
                .iter()
                .map(|language| FollowOn {
                    payload: JobPayload::TranslateContent {
                        item: item.clone(),
                        target_language: language.clone(),
                        enhanced,
                    },
                    priority: TRANSLATE_PRIORITY,
                })
                .collect();
            Ok(StageOutcome::Advance(followons))
        } else {
            Ok(StageOutcome::Advance(vec![FollowOn {
                payload: JobPayload::Publish {
                    item,
                    language: None,
                    enhanced,
                    translated: false,
                },
                priority: PUBLISH_PRIORITY,
            }]))
        }
    }

    async fn translate_content(
        &self,
        job: &Job,
        item: &FeedItem,
        target_language: &str,
        enhanced: bool,
    ) -> Result<StageOutcome> {
        if target_language.trim().is_empty() {
            return Err(PublisherError::Validation(
                "translation job without a target language".to_string(),
            ));
        }
        if item.content.trim().is_empty() {
            return Err(PublisherError::Validation(
                "translation job without source content".to_string(),
            ));
        }
        if !self.gateway.is_configured() {
            return Err(PublisherError::Configuration(
                "gateway not configured for translation".to_string(),
            ));
        }
        if self.gateway.is_rate_limited() {
            return Ok(StageOutcome::Defer(self.deferral_deadline()));
        }

        let translated = self
            .gateway
            .translate(&item.title, &item.content, target_language)
            .await?;

        let mut updated = item.clone();
        updated.title = translated.title;
        updated.content = translated.content_html;

        // NOTE: the dispatcher enqueues with this job's own source_id; a
        // translation job may outlive its originating source lookup.
        Ok(StageOutcome::Advance(vec![FollowOn {
            payload: JobPayload::Publish {
                item: updated,
                language: Some(target_language.to_string()),
                enhanced,
                translated: true,
            },
            priority: PUBLISH_PRIORITY,
        }]))
    }

    /// Hand the finished article to the content store and write the ledger.
    ///
    /// Daily-cap guard: a second DISTINCT item must not publish on a day the
    /// source already posted, but sibling-language publishes of the item
    /// already recorded for today pass through (one item, N languages).
    async fn publish(
        &self,
        job: &Job,
        item: &FeedItem,
        language: Option<&str>,
        enhanced: bool,
        translated: bool,
    ) -> Result<StageOutcome> {
        let source = self.registry.get_source(job.source_id).await?;

        let words = content::word_count(&item.content);
        if words < MIN_PUBLISH_WORDS {
            return Err(PublisherError::Validation(format!(
                "refusing to publish near-empty content: {} words",
                words
            )));
        }

        if self.ledger.has_posted_today(source.id).await?
            && !self.ledger.is_processed(source.id, &item.guid).await?
        {
            return Ok(StageOutcome::Skip("another item already published today"));
        }

        let author = if source.author.is_empty() {
            item.author.clone()
        } else {
            source.author.clone()
        };

        let article = NewArticle {
            title: content::strip_tags(&item.title).trim().to_string(),
            content_html: item.content.clone(),
            status: source.publish_status.clone(),
            author,
            category: source.category.clone(),
            language: language.map(|l| l.to_string()),
            source_link: item.link.clone(),
            published_at: item.published_at.unwrap_or_else(Utc::now),
        };

        let artifact_id = self.content_store.publish(&article).await?;

        if let Some(image_url) = content::first_image_url(&item.content) {
            if let Err(e) = self
                .content_store
                .attach_cover_image(&artifact_id, &image_url)
                .await
            {
                warn!("Cover image attach failed for {}: {}", artifact_id, e);
            }
        }

        self.ledger
            .mark_processed(
                source.id,
                &item.guid,
                Some(&artifact_id),
                ProcessedMeta {
                    language: language.map(|l| l.to_string()),
                    enhanced,
                    translated,
                    word_count: words,
                },
            )
            .await?;
        self.registry
            .record_post(source.id, Utc::now().date_naive())
            .await?;

        info!(
            "Source {}: published '{}' as artifact {} ({} words{})",
            source.id,
            article.title,
            artifact_id,
            words,
            language.map(|l| format!(", language {}", l)).unwrap_or_default()
        );

        Ok(StageOutcome::Done)
    }

    fn deferral_deadline(&self) -> DateTime<Utc> {
        self.gateway
            .rate_limited_until()
            .unwrap_or_else(|| Utc::now() + Duration::minutes(5))
    }
}

/// The excerpt handed to the gateway: the feed's own summary when present,
/// otherwise the first stretch of visible body text.
fn excerpt_of(item: &FeedItem) -> String {
    if !item.excerpt.trim().is_empty() {
        return item.excerpt.clone();
    }
    let text = content::strip_tags(&item.content);
    text.split_whitespace()
        .take(80)
        .collect::<Vec<_>>()
        .join(" ")
}
