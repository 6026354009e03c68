use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use crate::types::{Job, JobPayload, JobStatus, PublisherError, QueueStats, Result};

pub const DEFAULT_PRIORITY: i64 = 10;
pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;

/// Durable, priority-ordered, retryable work queue.
///
/// Leasing is a single UPDATE .. WHERE id IN (SELECT ..) RETURNING statement,
/// so concurrent drainers can never claim the same job twice. Completed jobs
/// are deleted; failed jobs are kept with their last error for operators.
pub struct JobQueue {
    db: SqlitePool,
}

impl JobQueue {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Enqueue one unit of work. Rejects unknown sources so orphan jobs never
    /// enter the table.
    pub async fn enqueue(
        &self,
        source_id: i64,
        payload: &JobPayload,
        priority: i64,
    ) -> Result<i64> {
        let known: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sources WHERE id = ?1")
            .bind(source_id)
            .fetch_one(&self.db)
            .await?;
        if known == 0 {
            return Err(PublisherError::InvalidSource { id: source_id });
        }

        let data = serde_json::to_string(payload)?;
        let now = Utc::now();

        let id = sqlx::query(
            r#"
            INSERT INTO jobs (source_id, kind, status, data, priority, max_attempts, created_at)
            VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(source_id)
        .bind(payload.kind().as_str())
        .bind(&data)
        .bind(priority)
        .bind(DEFAULT_MAX_ATTEMPTS)
        .bind(now)
        .execute(&self.db)
        .await?
        .last_insert_rowid();

        debug!(
            "Enqueued {} job {} for source {} at priority {}",
            payload.kind().as_str(),
            id,
            source_id,
            priority
        );
        Ok(id)
    }

    /// Atomically claim up to `limit` runnable jobs: pending, attempts left,
    /// past any backoff window; highest priority first, FIFO within a tier.
    /// Claimed jobs are marked in-flight with the attempt already counted.
    pub async fn lease_batch(&self, limit: i64) -> Result<Vec<Job>> {
        let now = Utc::now();

        let rows = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'in_flight', attempts = attempts + 1, processed_at = ?1
            WHERE id IN (
                SELECT id FROM jobs
                WHERE status = 'pending'
                  AND attempts < max_attempts
                  AND (not_before IS NULL OR not_before <= ?1)
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT ?2
            )
            RETURNING id, source_id, kind, status, data, priority, attempts, max_attempts,
                      last_error, not_before, created_at, processed_at
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        let jobs: Vec<Job> = rows.iter().map(job_from_row).collect::<Result<_>>()?;
        if !jobs.is_empty() {
            debug!("Leased {} jobs", jobs.len());
        }
        Ok(jobs)
    }

    /// Remove a finished job. Idempotent: completing a job twice (or a job
    /// already cleared by an operator) is a no-op.
    pub async fn complete(&self, job_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(job_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Record a failed execution: back to pending while attempts remain,
    /// terminal `failed` once the ceiling is hit.
    pub async fn fail(&self, job_id: i64, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'pending' END,
                last_error = ?1
            WHERE id = ?2 AND status = 'in_flight'
            "#,
        )
        .bind(error)
        .bind(job_id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            warn!("fail() on job {} which is not in flight", job_id);
        }
        Ok(())
    }

    /// Terminal failure regardless of remaining attempts, for jobs that can
    /// never succeed (unknown source, illegal stage transition).
    pub async fn fail_terminal(&self, job_id: i64, error: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = 'failed', last_error = ?1 WHERE id = ?2")
            .bind(error)
            .bind(job_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Return a leased job to pending WITHOUT consuming the attempt it was
    /// leased with, and hold it until `not_before`. Used when the gateway is
    /// known to be throttled: waiting out an outage must not burn retry
    /// budget.
    pub async fn defer(&self, job_id: i64, not_before: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                attempts = CASE WHEN attempts > 0 THEN attempts - 1 ELSE 0 END,
                not_before = ?1,
                processed_at = NULL
            WHERE id = ?2 AND status = 'in_flight'
            "#,
        )
        .bind(not_before)
        .bind(job_id)
        .execute(&self.db)
        .await?;

        debug!("Deferred job {} until {}", job_id, not_before);
        Ok(())
    }

    /// Re-queue jobs stuck in flight past the lease horizon (a crashed or
    /// wedged drainer). The consumed attempt stays consumed.
    pub async fn requeue_stale(&self, lease_timeout: Duration) -> Result<u64> {
        let cutoff = Utc::now() - lease_timeout;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'pending' END,
                last_error = COALESCE(last_error, 'lease expired')
            WHERE status = 'in_flight' AND processed_at < ?1
            "#,
        )
        .bind(cutoff)
        .execute(&self.db)
        .await?;

        let affected = result.rows_affected();
        if affected > 0 {
            warn!("Re-queued {} stale in-flight jobs", affected);
        }
        Ok(affected)
    }

    pub async fn get_job(&self, job_id: i64) -> Result<Job> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?1")
            .bind(job_id)
            .fetch_optional(&self.db)
            .await?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(PublisherError::JobNotFound { id: job_id }),
        }
    }

    /// Jobs currently in the given status, highest priority first. Gives
    /// operators visibility into what is waiting or wedged.
    pub async fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE status = ?1 ORDER BY priority DESC, created_at ASC, id ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(CASE WHEN status = 'pending' THEN 1 END) AS pending,
                COUNT(CASE WHEN status = 'in_flight' THEN 1 END) AS in_flight,
                COUNT(CASE WHEN status = 'failed' THEN 1 END) AS failed,
                COUNT(*) AS total
            FROM jobs
            "#,
        )
        .fetch_one(&self.db)
        .await?;

        Ok(QueueStats {
            pending: row.try_get("pending")?,
            in_flight: row.try_get("in_flight")?,
            failed: row.try_get("failed")?,
            total: row.try_get("total")?,
        })
    }

    /// Operator cleanup: drop every job in the given status.
    pub async fn clear_status(&self, status: JobStatus) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE status = ?1")
            .bind(status.as_str())
            .execute(&self.db)
            .await?;

        let affected = result.rows_affected();
        info!("Cleared {} {} jobs", affected, status.as_str());
        Ok(affected)
    }

    /// Drop pending work for a source being removed. In-flight jobs finish
    /// their current execution and fall out on completion.
    pub async fn purge_pending_for_source(&self, source_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE source_id = ?1 AND status = 'pending'")
            .bind(source_id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }

    /// Retention: failed jobs older than the horizon are dropped.
    pub async fn prune(&self, retention_days: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(retention_days);

        let result = sqlx::query("DELETE FROM jobs WHERE status = 'failed' AND created_at < ?1")
            .bind(cutoff)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected())
    }
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let status_raw: String = row.try_get("status")?;
    let status = JobStatus::parse(&status_raw)
        .ok_or_else(|| PublisherError::General(format!("unknown job status: {}", status_raw)))?;

    let data: String = row.try_get("data")?;
    let payload: JobPayload = serde_json::from_str(&data)?;

    Ok(Job {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        status,
        payload,
        priority: row.try_get("priority")?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        last_error: row.try_get("last_error")?,
        not_before: row.try_get("not_before")?,
        created_at: row.try_get("created_at")?,
        processed_at: row.try_get("processed_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::registry::SourceRegistry;
    use crate::types::NewSource;

    async fn queue_with_source() -> (JobQueue, i64) {
        let pool = db::connect_in_memory().await.unwrap();
        let registry = SourceRegistry::new(pool.clone());
        let source_id = registry
            .add_source(NewSource {
                feed_url: "https://example.com/feed.xml".to_string(),
                ..NewSource::default()
            })
            .await
            .unwrap();
        (JobQueue::new(pool), source_id)
    }

    #[tokio::test]
    async fn enqueue_rejects_unknown_source() {
        let (queue, _) = queue_with_source().await;
        let result = queue.enqueue(9999, &JobPayload::FetchAndQueue, 10).await;
        assert!(matches!(result, Err(PublisherError::InvalidSource { id: 9999 })));
    }

    #[tokio::test]
    async fn lease_orders_by_priority_then_fifo() {
        let (queue, source_id) = queue_with_source().await;

        let low = queue.enqueue(source_id, &JobPayload::FetchAndQueue, 7).await.unwrap();
        let high_first = queue.enqueue(source_id, &JobPayload::FetchAndQueue, 10).await.unwrap();
        let high_second = queue.enqueue(source_id, &JobPayload::FetchAndQueue, 10).await.unwrap();

        let leased = queue.lease_batch(10).await.unwrap();
        let ids: Vec<i64> = leased.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![high_first, high_second, low]);

        for job in &leased {
            assert_eq!(job.status, JobStatus::InFlight);
            assert_eq!(job.attempts, 1);
        }
    }

    #[tokio::test]
    async fn leased_jobs_are_not_leased_again() {
        let (queue, source_id) = queue_with_source().await;
        queue.enqueue(source_id, &JobPayload::FetchAndQueue, 10).await.unwrap();

        let first = queue.lease_batch(5).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = queue.lease_batch(5).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn concurrent_leases_never_overlap() {
        let (queue, source_id) = queue_with_source().await;
        for _ in 0..6 {
            queue.enqueue(source_id, &JobPayload::FetchAndQueue, 10).await.unwrap();
        }

        let queue = std::sync::Arc::new(queue);
        let a = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.lease_batch(4).await.unwrap() })
        };
        let b = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.lease_batch(4).await.unwrap() })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        let ids_a: std::collections::HashSet<i64> = a.iter().map(|j| j.id).collect();
        let ids_b: std::collections::HashSet<i64> = b.iter().map(|j| j.id).collect();
        assert!(ids_a.is_disjoint(&ids_b));
        assert_eq!(ids_a.len() + ids_b.len(), 6);
    }

    #[tokio::test]
    async fn fail_retries_until_ceiling_then_terminal() {
        let (queue, source_id) = queue_with_source().await;
        let id = queue.enqueue(source_id, &JobPayload::FetchAndQueue, 10).await.unwrap();

        for attempt in 1..=DEFAULT_MAX_ATTEMPTS {
            let leased = queue.lease_batch(1).await.unwrap();
            assert_eq!(leased.len(), 1, "attempt {} should lease", attempt);
            assert_eq!(leased[0].attempts, attempt);
            queue.fail(id, "boom").await.unwrap();
        }

        // ceiling reached: terminal, never leased again
        let job = queue.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
        assert!(queue.lease_batch(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn defer_restores_attempt_and_holds_job() {
        let (queue, source_id) = queue_with_source().await;
        let id = queue.enqueue(source_id, &JobPayload::FetchAndQueue, 10).await.unwrap();

        let leased = queue.lease_batch(1).await.unwrap();
        assert_eq!(leased[0].attempts, 1);

        queue.defer(id, Utc::now() + Duration::minutes(5)).await.unwrap();

        let job = queue.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);

        // still inside the backoff window: not leasable
        assert!(queue.lease_batch(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deferred_job_leases_after_window() {
        let (queue, source_id) = queue_with_source().await;
        let id = queue.enqueue(source_id, &JobPayload::FetchAndQueue, 10).await.unwrap();

        queue.lease_batch(1).await.unwrap();
        queue.defer(id, Utc::now() - Duration::seconds(1)).await.unwrap();

        let leased = queue.lease_batch(1).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].id, id);
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let (queue, source_id) = queue_with_source().await;
        let id = queue.enqueue(source_id, &JobPayload::FetchAndQueue, 10).await.unwrap();

        queue.lease_batch(1).await.unwrap();
        queue.complete(id).await.unwrap();
        queue.complete(id).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.total, 0);
    }

    #[tokio::test]
    async fn stats_count_by_status() {
        let (queue, source_id) = queue_with_source().await;

        let a = queue.enqueue(source_id, &JobPayload::FetchAndQueue, 10).await.unwrap();
        queue.enqueue(source_id, &JobPayload::FetchAndQueue, 10).await.unwrap();
        queue.enqueue(source_id, &JobPayload::FetchAndQueue, 10).await.unwrap();

        queue.lease_batch(1).await.unwrap();
        queue.fail_terminal(a, "dead").await.unwrap();
        queue.lease_batch(1).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.total, 3);
    }

    #[tokio::test]
    async fn requeue_stale_returns_wedged_jobs() {
        let (queue, source_id) = queue_with_source().await;
        let id = queue.enqueue(source_id, &JobPayload::FetchAndQueue, 10).await.unwrap();

        queue.lease_batch(1).await.unwrap();
        // nothing is stale yet
        assert_eq!(queue.requeue_stale(Duration::minutes(30)).await.unwrap(), 0);
        // with a zero-length lease everything in flight is stale
        assert_eq!(queue.requeue_stale(Duration::seconds(0)).await.unwrap(), 1);

        let job = queue.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn clear_status_removes_only_that_status() {
        let (queue, source_id) = queue_with_source().await;

        let a = queue.enqueue(source_id, &JobPayload::FetchAndQueue, 10).await.unwrap();
        queue.enqueue(source_id, &JobPayload::FetchAndQueue, 10).await.unwrap();

        queue.lease_batch(1).await.unwrap();
        queue.fail_terminal(a, "dead").await.unwrap();

        assert_eq!(queue.clear_status(JobStatus::Failed).await.unwrap(), 1);
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.pending, 1);
    }
}
