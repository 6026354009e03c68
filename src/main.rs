use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use feedpress::config::Config;
use feedpress::db;
use feedpress::feeds::HttpFeedReader;
use feedpress::gateway::{GatewayConfig, OpenAiGateway};
use feedpress::pipeline::{Orchestrator, IMMEDIATE_PRIORITY};
use feedpress::publisher::HttpContentStore;
use feedpress::rate_limit::RateLimitState;
use feedpress::registry::SourceUpdate;
use feedpress::scheduler::Scheduler;
use feedpress::types::{CheckFrequency, JobStatus, NewSource};

#[derive(Parser)]
#[command(name = "feedpress", about = "RSS-to-article pipeline publisher")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and queue drain loops until interrupted.
    Run,

    /// Register a new source.
    AddSource {
        #[arg(long)]
        url: String,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long, default_value = "")]
        category: String,
        #[arg(long, default_value = "")]
        author: String,
        #[arg(long, default_value = "draft")]
        status: String,
        #[arg(long, default_value = "daily")]
        frequency: String,
        /// Skip AI enhancement and publish items as they arrive.
        #[arg(long)]
        no_enhance: bool,
        /// Target translation languages, comma separated (implies translation).
        #[arg(long, value_delimiter = ',')]
        languages: Vec<String>,
        #[arg(long, default_value_t = 600)]
        min_words: u32,
    },

    /// List registered sources.
    ListSources,

    /// Edit a source's settings; omitted options keep their values.
    EditSource {
        id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        author: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        frequency: Option<String>,
        #[arg(long)]
        enhance: Option<bool>,
        #[arg(long, value_delimiter = ',')]
        languages: Option<Vec<String>>,
        #[arg(long)]
        min_words: Option<u32>,
    },

    /// Pause a source (no further checks).
    Pause { id: i64 },

    /// Resume a paused source.
    Resume { id: i64 },

    /// Remove a source: deactivate it and drop its pending jobs. History is
    /// retained.
    Remove { id: i64 },

    /// Queue an immediate check of one source and drain once.
    Check { id: i64 },

    /// Run a single queue drain cycle.
    Drain,

    /// Show queue counters.
    Stats,

    /// Delete queue entries in the given status (pending/in_flight/failed).
    Clear { status: String },
}

fn build_orchestrator(config: &Config, pool: sqlx::SqlitePool) -> Arc<Orchestrator> {
    let rate_limit = Arc::new(RateLimitState::new());

    let gateway = OpenAiGateway::new(
        GatewayConfig {
            endpoint: config.gateway_endpoint.clone(),
            api_key: config.gateway_api_key.clone(),
            model: config.gateway_model.clone(),
            timeout: config.gateway_timeout,
            ..GatewayConfig::default()
        },
        rate_limit,
    );

    let content_store = HttpContentStore::new(
        config.store_endpoint.clone(),
        config.store_token.clone(),
        config.gateway_timeout,
    );

    Arc::new(Orchestrator::new(
        pool,
        Arc::new(HttpFeedReader::new(std::time::Duration::from_secs(30))),
        Arc::new(gateway),
        Arc::new(content_store),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::from_env();

    let pool = db::connect(&config.database_url)
        .await
        .with_context(|| format!("opening database {}", config.database_url))?;

    let orchestrator = build_orchestrator(&config, pool);

    match cli.command {
        Command::Run => {
            let scheduler = Scheduler::new(orchestrator, config);
            tokio::select! {
                _ = scheduler.run() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down");
                }
            }
        }

        Command::AddSource {
            url,
            name,
            category,
            author,
            status,
            frequency,
            no_enhance,
            languages,
            min_words,
        } => {
            let frequency = CheckFrequency::parse(&frequency)
                .with_context(|| format!("unknown frequency: {}", frequency))?;

            let id = orchestrator
                .registry()
                .add_source(NewSource {
                    feed_url: url,
                    name,
                    category,
                    author,
                    publish_status: status,
                    enhance: !no_enhance,
                    translate: !languages.is_empty(),
                    target_languages: languages,
                    check_frequency: frequency,
                    min_words,
                })
                .await?;
            println!("Added source {}", id);
        }

        Command::ListSources => {
            for source in orchestrator.registry().list_sources().await? {
                println!(
                    "{:>4}  {}  [{}{}]  {}  last checked: {}  last post: {}",
                    source.id,
                    source.feed_url,
                    source.check_frequency.as_str(),
                    if source.is_active { "" } else { ", paused" },
                    if source.enhance { "enhanced" } else { "direct" },
                    source
                        .last_checked
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string()),
                    source
                        .last_post_date
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "never".to_string()),
                );
            }
        }

        Command::EditSource {
            id,
            name,
            category,
            author,
            status,
            frequency,
            enhance,
            languages,
            min_words,
        } => {
            let check_frequency = match frequency {
                Some(f) => Some(
                    CheckFrequency::parse(&f)
                        .with_context(|| format!("unknown frequency: {}", f))?,
                ),
                None => None,
            };

            let translate = languages.as_ref().map(|l| !l.is_empty());
            orchestrator
                .registry()
                .update_source(
                    id,
                    SourceUpdate {
                        name,
                        category,
                        author,
                        publish_status: status,
                        enhance,
                        translate,
                        target_languages: languages,
                        min_words,
                        check_frequency,
                        ..SourceUpdate::default()
                    },
                )
                .await?;
            println!("Updated source {}", id);
        }

        Command::Pause { id } => {
            orchestrator.registry().set_active(id, false).await?;
            println!("Paused source {}", id);
        }

        Command::Resume { id } => {
            orchestrator.registry().set_active(id, true).await?;
            println!("Resumed source {}", id);
        }

        Command::Remove { id } => {
            orchestrator.registry().set_active(id, false).await?;
            let purged = orchestrator.queue().purge_pending_for_source(id).await?;
            println!("Removed source {} ({} pending jobs dropped)", id, purged);
        }

        Command::Check { id } => {
            orchestrator.enqueue_check(id, IMMEDIATE_PRIORITY).await?;
            let summary = orchestrator.drain(config.drain_batch_size).await?;
            println!(
                "Checked source {}: {} jobs run, {} failed",
                id, summary.leased, summary.failed
            );
        }

        Command::Drain => {
            let scheduler = Scheduler::new(orchestrator, config);
            let summary = scheduler.drain_queue().await?;
            println!(
                "Drained: {} leased, {} completed, {} skipped, {} deferred, {} failed",
                summary.leased,
                summary.completed,
                summary.skipped,
                summary.deferred,
                summary.failed
            );
        }

        Command::Stats => {
            let stats = orchestrator.queue().stats().await?;
            println!(
                "pending: {}  in flight: {}  failed: {}  total: {}",
                stats.pending, stats.in_flight, stats.failed, stats.total
            );
        }

        Command::Clear { status } => {
            let status = JobStatus::parse(&status)
                .with_context(|| format!("unknown status: {}", status))?;
            let cleared = orchestrator.queue().clear_status(status).await?;
            println!("Cleared {} {} jobs", cleared, status.as_str());
        }
    }

    Ok(())
}
