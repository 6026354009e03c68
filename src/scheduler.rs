use std::sync::Arc;

use chrono::{Duration as ChronoDuration, NaiveTime, Utc};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::pipeline::{DrainSummary, Orchestrator, FETCH_PRIORITY};
use crate::types::Result;

/// Periodic triggers: a coarse source check, a fine queue drain, a midnight
/// counter reset, and a retention sweep. Each tick is isolated: an error is
/// logged and the loop keeps going.
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    config: Config,
    drainer_id: String,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, config: Config) -> Self {
        Self {
            orchestrator,
            config,
            drainer_id: format!("drainer-{}", Uuid::new_v4()),
        }
    }

    /// Enqueue a fetch-and-queue job for every active source that is due by
    /// its cadence and has not posted today. Returns how many were queued.
    pub async fn check_sources(&self) -> Result<usize> {
        let now = Utc::now();
        let today = now.date_naive();

        let candidates = self.orchestrator.registry().list_candidates(today).await?;
        let mut queued = 0;

        for source in candidates {
            if !source.should_check(now) {
                continue;
            }
            // list_candidates already filtered on the source row; the daily
            // post table is the authoritative check.
            if self
                .orchestrator
                .ledger()
                .has_posted_on(source.id, today)
                .await?
            {
                continue;
            }

            self.orchestrator
                .enqueue_check(source.id, FETCH_PRIORITY)
                .await?;
            queued += 1;
        }

        if queued > 0 {
            info!("Source check queued {} fetch jobs", queued);
        }
        Ok(queued)
    }

    /// One drain cycle: recover wedged leases, then lease and run a batch.
    pub async fn drain_queue(&self) -> Result<DrainSummary> {
        let lease_timeout = ChronoDuration::from_std(self.config.lease_timeout)
            .unwrap_or_else(|_| ChronoDuration::minutes(30));
        self.orchestrator.queue().requeue_stale(lease_timeout).await?;

        let summary = self.orchestrator.drain(self.config.drain_batch_size).await?;
        if summary.leased > 0 {
            info!(
                "Drain ({}): {} leased, {} completed, {} skipped, {} deferred, {} failed",
                self.drainer_id,
                summary.leased,
                summary.completed,
                summary.skipped,
                summary.deferred,
                summary.failed
            );
        }
        Ok(summary)
    }

    /// Midnight cleanup of the redundant per-source counters. The daily post
    /// table, not this reset, enforces the cap.
    pub async fn daily_reset(&self) -> Result<u64> {
        self.orchestrator
            .registry()
            .reset_daily_counters(Utc::now().date_naive())
            .await
    }

    /// Retention sweep over failed jobs and stale ledger history.
    pub async fn prune(&self) -> Result<u64> {
        let jobs = self
            .orchestrator
            .queue()
            .prune(self.config.job_retention_days)
            .await?;
        let history = self
            .orchestrator
            .ledger()
            .prune(
                self.config.processed_retention_days,
                self.config.daily_post_retention_days,
            )
            .await?;

        if jobs + history > 0 {
            info!("Retention removed {} job rows, {} history rows", jobs, history);
        }
        Ok(jobs + history)
    }

    /// Run all triggers until the task is cancelled (the binary races this
    /// against ctrl-c).
    pub async fn run(&self) {
        info!(
            "Scheduler {} running: check every {:?}, drain every {:?} (batch {})",
            self.drainer_id,
            self.config.check_interval,
            self.config.drain_interval,
            self.config.drain_batch_size
        );

        let mut check = tokio::time::interval(self.config.check_interval);
        let mut drain = tokio::time::interval(self.config.drain_interval);
        let mut retention = tokio::time::interval(self.config.retention_interval);

        loop {
            tokio::select! {
                _ = check.tick() => {
                    if let Err(e) = self.check_sources().await {
                        error!("Source check failed: {}", e);
                    }
                }
                _ = drain.tick() => {
                    if let Err(e) = self.drain_queue().await {
                        error!("Queue drain failed: {}", e);
                    }
                }
                _ = retention.tick() => {
                    if let Err(e) = self.prune().await {
                        error!("Retention sweep failed: {}", e);
                    }
                }
                _ = tokio::time::sleep(until_next_midnight()) => {
                    debug!("Midnight boundary");
                    if let Err(e) = self.daily_reset().await {
                        error!("Daily reset failed: {}", e);
                    }
                }
            }
        }
    }
}

fn until_next_midnight() -> std::time::Duration {
    let now = Utc::now();
    let next = (now.date_naive() + ChronoDuration::days(1))
        .and_time(NaiveTime::MIN)
        .and_utc();
    (next - now).to_std().unwrap_or(std::time::Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn midnight_is_always_in_the_future() {
        let wait = until_next_midnight();
        assert!(wait > std::time::Duration::from_secs(0));
        assert!(wait <= std::time::Duration::from_secs(24 * 3600));
    }
}
