pub mod config;
pub mod content;
pub mod db;
pub mod feeds;
pub mod gateway;
pub mod ledger;
pub mod pipeline;
pub mod publisher;
pub mod queue;
pub mod rate_limit;
pub mod registry;
pub mod scheduler;
pub mod types;

pub use config::Config;
pub use feeds::{FeedReader, HttpFeedReader, StaticFeedReader};
pub use gateway::{ContentGateway, GatewayConfig, MockGateway, OpenAiGateway};
pub use ledger::{DedupLedger, ProcessedMeta};
pub use pipeline::{DrainSummary, Orchestrator, StageOutcome};
pub use publisher::{ContentStore, HttpContentStore, MemoryContentStore};
pub use queue::JobQueue;
pub use rate_limit::RateLimitState;
pub use registry::{SourceRegistry, SourceUpdate};
pub use scheduler::Scheduler;
pub use types::*;
