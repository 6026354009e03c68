use chrono::{Duration, NaiveDate, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::types::Result;

/// Metadata stored alongside a processed item.
#[derive(Debug, Clone, Default)]
pub struct ProcessedMeta {
    pub language: Option<String>,
    pub enhanced: bool,
    pub translated: bool,
    pub word_count: usize,
}

/// Authoritative duplicate prevention: which items each source has already
/// processed, and which sources have posted today. Both tables carry unique
/// natural keys, so concurrent writers collapse onto one row instead of
/// racing.
pub struct DedupLedger {
    db: SqlitePool,
}

impl DedupLedger {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn is_processed(&self, source_id: i64, item_guid: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM processed_items WHERE source_id = ?1 AND item_guid = ?2",
        )
        .bind(source_id)
        .bind(item_guid)
        .fetch_one(&self.db)
        .await?;

        Ok(count > 0)
    }

    /// Idempotent upsert. When the item produced an artifact, the daily post
    /// record is written in the same breath; that row is the one-post-per-day
    /// enforcement point.
    pub async fn mark_processed(
        &self,
        source_id: i64,
        item_guid: &str,
        artifact_id: Option<&str>,
        meta: ProcessedMeta,
    ) -> Result<()> {
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO processed_items
                (source_id, item_guid, artifact_id, language, enhanced, translated,
                 word_count, processed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(source_id, item_guid) DO UPDATE SET
                artifact_id = COALESCE(excluded.artifact_id, artifact_id),
                processed_at = excluded.processed_at
            "#,
        )
        .bind(source_id)
        .bind(item_guid)
        .bind(artifact_id)
        .bind(meta.language.as_deref().unwrap_or("en"))
        .bind(meta.enhanced as i64)
        .bind(meta.translated as i64)
        .bind(meta.word_count as i64)
        .bind(now)
        .execute(&self.db)
        .await?;

        if artifact_id.is_some() {
            self.record_daily_post(source_id, now.date_naive(), artifact_id)
                .await?;
        }

        Ok(())
    }

    /// At most one row per (source, date); later writes for the same day are
    /// ignored, which is what makes multi-language fan-out safe.
    pub async fn record_daily_post(
        &self,
        source_id: i64,
        date: NaiveDate,
        artifact_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO daily_posts (source_id, post_date, artifact_id, posted_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(source_id)
        .bind(date)
        .bind(artifact_id)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        Ok(())
    }

    pub async fn has_posted_today(&self, source_id: i64) -> Result<bool> {
        self.has_posted_on(source_id, Utc::now().date_naive()).await
    }

    pub async fn has_posted_on(&self, source_id: i64, date: NaiveDate) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM daily_posts WHERE source_id = ?1 AND post_date = ?2",
        )
        .bind(source_id)
        .bind(date)
        .fetch_one(&self.db)
        .await?;

        Ok(count > 0)
    }

    pub async fn daily_post_count(&self, source_id: i64, date: NaiveDate) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM daily_posts WHERE source_id = ?1 AND post_date = ?2",
        )
        .bind(source_id)
        .bind(date)
        .fetch_one(&self.db)
        .await?;

        Ok(count)
    }

    /// Drop history beyond the retention horizons.
    pub async fn prune(&self, processed_days: i64, daily_post_days: i64) -> Result<u64> {
        let processed_cutoff = Utc::now() - Duration::days(processed_days);
        let daily_cutoff = (Utc::now() - Duration::days(daily_post_days)).date_naive();

        let processed = sqlx::query("DELETE FROM processed_items WHERE processed_at < ?1")
            .bind(processed_cutoff)
            .execute(&self.db)
            .await?
            .rows_affected();

        let daily = sqlx::query("DELETE FROM daily_posts WHERE post_date < ?1")
            .bind(daily_cutoff)
            .execute(&self.db)
            .await?
            .rows_affected();

        if processed + daily > 0 {
            debug!("Pruned {} processed items, {} daily post records", processed, daily);
        }
        Ok(processed + daily)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn ledger() -> DedupLedger {
        let pool = db::connect_in_memory().await.unwrap();
        DedupLedger::new(pool)
    }

    #[tokio::test]
    async fn mark_processed_is_idempotent() {
        let ledger = ledger().await;

        assert!(!ledger.is_processed(1, "abc123").await.unwrap());

        ledger
            .mark_processed(1, "abc123", Some("artifact-1"), ProcessedMeta::default())
            .await
            .unwrap();
        ledger
            .mark_processed(1, "abc123", Some("artifact-1"), ProcessedMeta::default())
            .await
            .unwrap();

        assert!(ledger.is_processed(1, "abc123").await.unwrap());

        let today = Utc::now().date_naive();
        assert_eq!(ledger.daily_post_count(1, today).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn daily_record_is_unique_per_day() {
        let ledger = ledger().await;
        let today = Utc::now().date_naive();

        ledger.record_daily_post(7, today, Some("a1")).await.unwrap();
        ledger.record_daily_post(7, today, Some("a2")).await.unwrap();

        assert_eq!(ledger.daily_post_count(7, today).await.unwrap(), 1);
        assert!(ledger.has_posted_today(7).await.unwrap());
        assert!(!ledger.has_posted_today(8).await.unwrap());
    }

    #[tokio::test]
    async fn processing_without_artifact_does_not_claim_the_day() {
        let ledger = ledger().await;

        ledger
            .mark_processed(3, "guid-x", None, ProcessedMeta::default())
            .await
            .unwrap();

        assert!(ledger.is_processed(3, "guid-x").await.unwrap());
        assert!(!ledger.has_posted_today(3).await.unwrap());
    }

    #[tokio::test]
    async fn prune_drops_old_history() {
        let ledger = ledger().await;
        let old_date = Utc::now().date_naive() - Duration::days(400);

        ledger.record_daily_post(1, old_date, None).await.unwrap();
        ledger
            .record_daily_post(1, Utc::now().date_naive(), None)
            .await
            .unwrap();

        let removed = ledger.prune(90, 180).await.unwrap();
        assert_eq!(removed, 1);
        assert!(ledger.has_posted_today(1).await.unwrap());
    }
}
