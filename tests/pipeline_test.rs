//! End-to-end pipeline tests: scheduler check → queue drain → publish, run
//! against the in-memory store with mock collaborators.

use std::sync::Arc;

use chrono::{Duration, Utc};
use feedpress::config::Config;
use feedpress::db;
use feedpress::feeds::StaticFeedReader;
use feedpress::gateway::MockGateway;
use feedpress::pipeline::Orchestrator;
use feedpress::publisher::MemoryContentStore;
use feedpress::scheduler::Scheduler;
use feedpress::types::{
    CheckFrequency, FeedItem, GeneratedContent, JobKind, JobPayload, JobStatus, NewSource,
};
use tracing::info;

const FEED_URL: &str = "https://example.com/feed.xml";

struct Harness {
    orchestrator: Arc<Orchestrator>,
    scheduler: Scheduler,
    feed_reader: Arc<StaticFeedReader>,
    gateway: Arc<MockGateway>,
    store: Arc<MemoryContentStore>,
}

async fn harness_with_gateway(gateway: MockGateway) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();

    let pool = db::connect_in_memory().await.unwrap();
    let feed_reader = Arc::new(StaticFeedReader::new());
    let gateway = Arc::new(gateway);
    let store = Arc::new(MemoryContentStore::new());

    let orchestrator = Arc::new(Orchestrator::new(
        pool,
        feed_reader.clone(),
        gateway.clone(),
        store.clone(),
    ));
    let scheduler = Scheduler::new(orchestrator.clone(), Config::default());

    Harness {
        orchestrator,
        scheduler,
        feed_reader,
        gateway,
        store,
    }
}

async fn harness() -> Harness {
    harness_with_gateway(MockGateway::new()).await
}

fn item(guid: &str) -> FeedItem {
    let body = vec!["word"; 120].join(" ");
    FeedItem {
        guid: guid.to_string(),
        title: format!("Item {}", guid),
        content: format!(
            "<p>{}</p><img src=\"https://cdn.example.com/{}.jpg\">",
            body, guid
        ),
        excerpt: "A short excerpt".to_string(),
        link: format!("https://example.com/{}", guid),
        published_at: None,
        author: "Feed Author".to_string(),
    }
}

async fn add_source(harness: &Harness, new: NewSource) -> i64 {
    harness.orchestrator.registry().add_source(new).await.unwrap()
}

fn source_defaults() -> NewSource {
    NewSource {
        feed_url: FEED_URL.to_string(),
        name: "Test Source".to_string(),
        check_frequency: CheckFrequency::Daily,
        min_words: 100,
        ..NewSource::default()
    }
}

/// Drain repeatedly until the queue stops yielding leases. Bounded so a
/// misbehaving pipeline fails the test instead of hanging it.
async fn drain_until_idle(harness: &Harness) {
    for _ in 0..20 {
        let summary = harness.orchestrator.drain(10).await.unwrap();
        if summary.leased == 0 {
            return;
        }
        info!(
            "drain cycle: {} leased, {} completed, {} failed",
            summary.leased, summary.completed, summary.failed
        );
    }
    panic!("queue did not settle after 20 drain cycles");
}

#[tokio::test]
async fn scenario_a_single_item_enhanced_publish() {
    let harness = harness().await;
    let source_id = add_source(&harness, source_defaults()).await;
    harness.feed_reader.set_items(FEED_URL, vec![item("abc123")]).await;

    let queued = harness.scheduler.check_sources().await.unwrap();
    assert_eq!(queued, 1, "never-checked source should be due");

    drain_until_idle(&harness).await;

    // exactly one dedup record, one daily post row, nothing left queued
    let ledger = harness.orchestrator.ledger();
    assert!(ledger.is_processed(source_id, "abc123").await.unwrap());
    let today = Utc::now().date_naive();
    assert_eq!(ledger.daily_post_count(source_id, today).await.unwrap(), 1);

    let stats = harness.orchestrator.queue().stats().await.unwrap();
    assert_eq!(stats.total, 0);

    let published = harness.store.published();
    assert_eq!(published.len(), 1);
    assert!(published[0].title.starts_with("Generated:"));
    assert_eq!(harness.gateway.generate_calls(), 1);

    let source = harness
        .orchestrator
        .registry()
        .get_source(source_id)
        .await
        .unwrap();
    assert_eq!(source.last_post_date, Some(today));
    assert!(source.last_checked.is_some());
}

#[tokio::test]
async fn scenario_b_translation_fanout_keeps_one_daily_row() {
    let harness = harness().await;
    let source_id = add_source(
        &harness,
        NewSource {
            translate: true,
            target_languages: vec!["fr".to_string(), "es".to_string()],
            ..source_defaults()
        },
    )
    .await;
    harness.feed_reader.set_items(FEED_URL, vec![item("abc123")]).await;

    harness.scheduler.check_sources().await.unwrap();
    drain_until_idle(&harness).await;

    // two artifacts, one per language...
    let published = harness.store.published();
    assert_eq!(published.len(), 2);
    let mut languages: Vec<_> = published
        .iter()
        .map(|a| a.language.clone().unwrap())
        .collect();
    languages.sort();
    assert_eq!(languages, vec!["es", "fr"]);
    assert_eq!(harness.gateway.translate_calls(), 2);

    // ...but still exactly one daily post row and one dedup record
    let today = Utc::now().date_naive();
    let ledger = harness.orchestrator.ledger();
    assert_eq!(ledger.daily_post_count(source_id, today).await.unwrap(), 1);
    assert!(ledger.is_processed(source_id, "abc123").await.unwrap());

    let stats = harness.orchestrator.queue().stats().await.unwrap();
    assert_eq!(stats.total, 0);
}

#[tokio::test]
async fn scenario_c_posted_today_is_never_checked() {
    let harness = harness().await;
    let source_id = add_source(&harness, source_defaults()).await;
    harness.feed_reader.set_items(FEED_URL, vec![item("abc123")]).await;

    // source already published today
    let today = Utc::now().date_naive();
    harness
        .orchestrator
        .ledger()
        .record_daily_post(source_id, today, Some("artifact-0"))
        .await
        .unwrap();
    harness
        .orchestrator
        .registry()
        .record_post(source_id, today)
        .await
        .unwrap();

    let queued = harness.scheduler.check_sources().await.unwrap();
    assert_eq!(queued, 0);

    let stats = harness.orchestrator.queue().stats().await.unwrap();
    assert_eq!(stats.total, 0);
    assert_eq!(harness.store.published_count(), 0);
}

#[tokio::test]
async fn already_processed_items_enqueue_nothing() {
    let harness = harness().await;
    let source_id = add_source(&harness, source_defaults()).await;
    harness.feed_reader.set_items(FEED_URL, vec![item("abc123")]).await;

    // item known to the ledger, but no artifact and no daily post
    harness
        .orchestrator
        .ledger()
        .mark_processed(source_id, "abc123", None, Default::default())
        .await
        .unwrap();

    harness.scheduler.check_sources().await.unwrap();
    drain_until_idle(&harness).await;

    assert_eq!(harness.store.published_count(), 0);
    assert_eq!(harness.gateway.generate_calls(), 0);
    let stats = harness.orchestrator.queue().stats().await.unwrap();
    assert_eq!(stats.total, 0);
}

#[tokio::test]
async fn rate_limit_deferral_burns_no_attempts() {
    let harness = harness().await;
    let source_id = add_source(&harness, source_defaults()).await;
    harness.feed_reader.set_items(FEED_URL, vec![item("abc123")]).await;

    harness.orchestrator.enqueue_check(source_id, 10).await.unwrap();
    // run the fetch stage only: it enqueues the generate job
    harness.orchestrator.drain(1).await.unwrap();

    harness.gateway.set_rate_limited(true);
    let summary = harness.orchestrator.drain(1).await.unwrap();
    assert_eq!(summary.deferred, 1);

    let pending = harness
        .orchestrator
        .queue()
        .jobs_with_status(JobStatus::Pending)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind(), JobKind::GenerateContent);
    assert_eq!(pending[0].attempts, 0, "deferral must not consume an attempt");
    assert!(pending[0].not_before.is_some());

    assert_eq!(harness.gateway.generate_calls(), 0);
    assert_eq!(harness.store.published_count(), 0);
}

#[tokio::test]
async fn quality_gate_regenerates_exactly_once_then_fails() {
    let harness = harness().await;
    let source_id = add_source(&harness, source_defaults()).await;
    harness.feed_reader.set_items(FEED_URL, vec![item("abc123")]).await;

    // both the draft and the regeneration come back too short
    for _ in 0..2 {
        harness.gateway.script_response(GeneratedContent {
            title: "Short".to_string(),
            content_html: "<p>tiny</p>".to_string(),
        });
    }

    harness.orchestrator.enqueue_check(source_id, 10).await.unwrap();
    harness.orchestrator.drain(1).await.unwrap(); // fetch
    let summary = harness.orchestrator.drain(1).await.unwrap(); // generate

    assert_eq!(summary.failed, 1);
    assert_eq!(
        harness.gateway.generate_calls(),
        2,
        "one draft + exactly one regeneration"
    );
    assert_eq!(harness.store.published_count(), 0);

    let pending = harness
        .orchestrator
        .queue()
        .jobs_with_status(JobStatus::Pending)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 1);
    assert!(pending[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("quality floor"));
}

#[tokio::test]
async fn quality_gate_accepts_successful_regeneration() {
    let harness = harness().await;
    let source_id = add_source(&harness, source_defaults()).await;
    harness.feed_reader.set_items(FEED_URL, vec![item("abc123")]).await;

    // short draft, then the mock's default (long) response
    harness.gateway.script_response(GeneratedContent {
        title: "Short".to_string(),
        content_html: "<p>tiny</p>".to_string(),
    });

    harness.scheduler.check_sources().await.unwrap();
    drain_until_idle(&harness).await;

    assert_eq!(harness.gateway.generate_calls(), 2);
    assert_eq!(harness.store.published_count(), 1);
}

#[tokio::test]
async fn unconfigured_gateway_passes_item_through() {
    let harness = harness_with_gateway(MockGateway::unconfigured()).await;
    let source_id = add_source(&harness, source_defaults()).await;
    harness.feed_reader.set_items(FEED_URL, vec![item("abc123")]).await;

    harness.scheduler.check_sources().await.unwrap();
    drain_until_idle(&harness).await;

    // enhancement skipped, original item published directly
    assert_eq!(harness.gateway.generate_calls(), 0);
    let published = harness.store.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].title, "Item abc123");
    assert!(harness
        .orchestrator
        .ledger()
        .is_processed(source_id, "abc123")
        .await
        .unwrap());
}

#[tokio::test]
async fn direct_publish_source_skips_the_gateway() {
    let harness = harness().await;
    let source_id = add_source(
        &harness,
        NewSource {
            enhance: false,
            ..source_defaults()
        },
    )
    .await;
    harness.feed_reader.set_items(FEED_URL, vec![item("abc123")]).await;

    harness.scheduler.check_sources().await.unwrap();
    drain_until_idle(&harness).await;

    assert_eq!(harness.gateway.generate_calls(), 0);
    assert_eq!(harness.gateway.translate_calls(), 0);
    assert_eq!(harness.store.published_count(), 1);
    assert!(harness
        .orchestrator
        .ledger()
        .is_processed(source_id, "abc123")
        .await
        .unwrap());
}

#[tokio::test]
async fn cover_image_is_attached_best_effort() {
    let harness = harness_with_gateway(MockGateway::unconfigured()).await;
    add_source(&harness, source_defaults()).await;
    harness.feed_reader.set_items(FEED_URL, vec![item("pic1")]).await;

    harness.scheduler.check_sources().await.unwrap();
    drain_until_idle(&harness).await;

    let covers = harness.store.covers();
    assert_eq!(covers.len(), 1);
    assert_eq!(covers[0].1, "https://cdn.example.com/pic1.jpg");
}

#[tokio::test]
async fn second_item_same_day_is_skipped_not_published() {
    let harness = harness().await;
    let source_id = add_source(&harness, source_defaults()).await;
    harness
        .feed_reader
        .set_items(FEED_URL, vec![item("first"), item("second")])
        .await;

    harness.scheduler.check_sources().await.unwrap();
    drain_until_idle(&harness).await;
    assert_eq!(harness.store.published_count(), 1);

    // make the source due again despite the cadence
    harness
        .orchestrator
        .registry()
        .touch_checked(source_id, Utc::now() - Duration::days(2))
        .await
        .unwrap();

    // scheduler refuses to queue it (posted today) ...
    assert_eq!(harness.scheduler.check_sources().await.unwrap(), 0);

    // ... a forced check is skipped at the fetch stage ...
    harness.orchestrator.enqueue_check(source_id, 12).await.unwrap();
    drain_until_idle(&harness).await;
    assert_eq!(harness.store.published_count(), 1);

    // ... and a publish job that was already in flight for a DIFFERENT item
    // is stopped by the publish-time guard
    harness
        .orchestrator
        .queue()
        .enqueue(
            source_id,
            &JobPayload::Publish {
                item: item("second"),
                language: None,
                enhanced: false,
                translated: false,
            },
            7,
        )
        .await
        .unwrap();
    drain_until_idle(&harness).await;

    assert_eq!(harness.store.published_count(), 1);
    let today = Utc::now().date_naive();
    assert_eq!(
        harness
            .orchestrator
            .ledger()
            .daily_post_count(source_id, today)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn cadence_gates_the_scheduler() {
    let harness = harness().await;
    let source_id = add_source(
        &harness,
        NewSource {
            check_frequency: CheckFrequency::Hourly,
            ..source_defaults()
        },
    )
    .await;
    harness.feed_reader.set_items(FEED_URL, vec![]).await;

    // first check: never checked, so due; fetch finds no items
    assert_eq!(harness.scheduler.check_sources().await.unwrap(), 1);
    drain_until_idle(&harness).await;

    // checked moments ago: not due
    assert_eq!(harness.scheduler.check_sources().await.unwrap(), 0);

    // checked two hours ago: hourly cadence makes it due again
    harness
        .orchestrator
        .registry()
        .touch_checked(source_id, Utc::now() - Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(harness.scheduler.check_sources().await.unwrap(), 1);
}

#[tokio::test]
async fn paused_sources_are_ignored() {
    let harness = harness().await;
    let source_id = add_source(&harness, source_defaults()).await;
    harness.feed_reader.set_items(FEED_URL, vec![item("abc123")]).await;

    harness
        .orchestrator
        .registry()
        .set_active(source_id, false)
        .await
        .unwrap();

    assert_eq!(harness.scheduler.check_sources().await.unwrap(), 0);

    // a stale fetch job against a paused source completes as a no-op
    harness.orchestrator.enqueue_check(source_id, 10).await.unwrap();
    drain_until_idle(&harness).await;
    assert_eq!(harness.store.published_count(), 0);
}

#[tokio::test]
async fn near_empty_content_is_refused_at_publish() {
    let harness = harness_with_gateway(MockGateway::unconfigured()).await;
    add_source(&harness, source_defaults()).await;

    let mut thin = item("thin");
    thin.content = "<p>barely anything here</p>".to_string();
    harness.feed_reader.set_items(FEED_URL, vec![thin]).await;

    harness.scheduler.check_sources().await.unwrap();
    drain_until_idle(&harness).await;

    assert_eq!(harness.store.published_count(), 0);
    let failed = harness
        .orchestrator
        .queue()
        .jobs_with_status(JobStatus::Failed)
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("near-empty"));
}
