use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};
use url::Url;

use crate::types::{CheckFrequency, NewSource, PublisherError, Result, Source};

/// Partial update for the operator's edit command. `None` keeps the stored
/// value.
#[derive(Debug, Clone, Default)]
pub struct SourceUpdate {
    pub name: Option<String>,
    pub category: Option<String>,
    pub author: Option<String>,
    pub publish_status: Option<String>,
    pub enhance: Option<bool>,
    pub translate: Option<bool>,
    pub target_languages: Option<Vec<String>>,
    pub content_domain: Option<String>,
    pub content_angle: Option<String>,
    pub content_length: Option<String>,
    pub min_words: Option<u32>,
    pub custom_instructions: Option<String>,
    pub check_frequency: Option<CheckFrequency>,
}

/// CRUD and eligibility queries over the sources table.
pub struct SourceRegistry {
    db: SqlitePool,
}

impl SourceRegistry {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn add_source(&self, new: NewSource) -> Result<i64> {
        let parsed = Url::parse(&new.feed_url)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(PublisherError::Validation(format!(
                "unsupported feed URL scheme: {}",
                parsed.scheme()
            )));
        }

        let existing: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sources WHERE feed_url = ?1")
                .bind(&new.feed_url)
                .fetch_one(&self.db)
                .await?;
        if existing > 0 {
            return Err(PublisherError::Validation(format!(
                "feed URL already registered: {}",
                new.feed_url
            )));
        }

        let now = Utc::now();
        let languages = serde_json::to_string(&new.target_languages)?;

        let id = sqlx::query(
            r#"
            INSERT INTO sources
                (feed_url, name, category, author, publish_status, enhance, translate,
                 target_languages, check_frequency, min_words, is_active, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, ?11, ?11)
            "#,
        )
        .bind(&new.feed_url)
        .bind(&new.name)
        .bind(&new.category)
        .bind(&new.author)
        .bind(&new.publish_status)
        .bind(new.enhance as i64)
        .bind(new.translate as i64)
        .bind(&languages)
        .bind(new.check_frequency.as_str())
        .bind(new.min_words as i64)
        .bind(now)
        .execute(&self.db)
        .await?
        .last_insert_rowid();

        info!("Registered source {} ({})", id, new.feed_url);
        Ok(id)
    }

    pub async fn get_source(&self, id: i64) -> Result<Source> {
        let row = sqlx::query("SELECT * FROM sources WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

        match row {
            Some(row) => source_from_row(&row),
            None => Err(PublisherError::SourceNotFound { id }),
        }
    }

    pub async fn exists(&self, id: i64) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sources WHERE id = ?1")
            .bind(id)
            .fetch_one(&self.db)
            .await?;
        Ok(count > 0)
    }

    pub async fn list_sources(&self) -> Result<Vec<Source>> {
        let rows = sqlx::query("SELECT * FROM sources ORDER BY created_at")
            .fetch_all(&self.db)
            .await?;

        rows.iter().map(source_from_row).collect()
    }

    /// Active sources that have not posted on `today`: the candidates the
    /// scheduler considers, before the cadence filter.
    pub async fn list_candidates(&self, today: NaiveDate) -> Result<Vec<Source>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM sources
            WHERE is_active = 1
              AND (last_post_date IS NULL OR last_post_date < ?1)
            ORDER BY last_post_date ASC, created_at ASC
            "#,
        )
        .bind(today)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(source_from_row).collect()
    }

    pub async fn update_source(&self, id: i64, update: SourceUpdate) -> Result<()> {
        if !self.exists(id).await? {
            return Err(PublisherError::SourceNotFound { id });
        }

        let languages = match &update.target_languages {
            Some(langs) => Some(serde_json::to_string(langs)?),
            None => None,
        };

        sqlx::query(
            r#"
            UPDATE sources SET
                name = COALESCE(?1, name),
                category = COALESCE(?2, category),
                author = COALESCE(?3, author),
                publish_status = COALESCE(?4, publish_status),
                enhance = COALESCE(?5, enhance),
                translate = COALESCE(?6, translate),
                target_languages = COALESCE(?7, target_languages),
                content_domain = COALESCE(?8, content_domain),
                content_angle = COALESCE(?9, content_angle),
                content_length = COALESCE(?10, content_length),
                min_words = COALESCE(?11, min_words),
                custom_instructions = COALESCE(?12, custom_instructions),
                check_frequency = COALESCE(?13, check_frequency),
                updated_at = ?14
            WHERE id = ?15
            "#,
        )
        .bind(update.name)
        .bind(update.category)
        .bind(update.author)
        .bind(update.publish_status)
        .bind(update.enhance.map(|b| b as i64))
        .bind(update.translate.map(|b| b as i64))
        .bind(languages)
        .bind(update.content_domain)
        .bind(update.content_angle)
        .bind(update.content_length)
        .bind(update.min_words.map(|w| w as i64))
        .bind(update.custom_instructions)
        .bind(update.check_frequency.map(|f| f.as_str()))
        .bind(Utc::now())
        .bind(id)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    pub async fn set_active(&self, id: i64, active: bool) -> Result<()> {
        let result = sqlx::query("UPDATE sources SET is_active = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(active as i64)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(PublisherError::SourceNotFound { id });
        }

        info!("Source {} {}", id, if active { "resumed" } else { "paused" });
        Ok(())
    }

    pub async fn touch_checked(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE sources SET last_checked = ?1, updated_at = ?1 WHERE id = ?2")
            .bind(now)
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Stamp the source's post-date bookkeeping after a successful publish.
    pub async fn record_post(&self, id: i64, date: NaiveDate) -> Result<()> {
        sqlx::query(
            "UPDATE sources SET last_post_date = ?1, posts_today = 1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(date)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn record_error(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query("UPDATE sources SET last_error = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(error)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Midnight cleanup: zero the redundant posts_today flag for sources
    /// whose last post was before `today`. The daily_posts table remains the
    /// source of truth for the daily cap.
    pub async fn reset_daily_counters(&self, today: NaiveDate) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sources SET posts_today = 0
            WHERE posts_today != 0 AND (last_post_date IS NULL OR last_post_date < ?1)
            "#,
        )
        .bind(today)
        .execute(&self.db)
        .await?;

        let affected = result.rows_affected();
        if affected > 0 {
            debug!("Reset daily counters on {} sources", affected);
        }
        Ok(affected)
    }
}

fn source_from_row(row: &SqliteRow) -> Result<Source> {
    let languages_json: String = row.try_get("target_languages")?;
    let target_languages: Vec<String> =
        serde_json::from_str(&languages_json).unwrap_or_default();

    let frequency: String = row.try_get("check_frequency")?;
    let check_frequency = CheckFrequency::parse(&frequency).unwrap_or(CheckFrequency::Daily);

    Ok(Source {
        id: row.try_get("id")?,
        feed_url: row.try_get("feed_url")?,
        name: row.try_get("name")?,
        category: row.try_get("category")?,
        author: row.try_get("author")?,
        publish_status: row.try_get("publish_status")?,
        enhance: row.try_get::<i64, _>("enhance")? != 0,
        translate: row.try_get::<i64, _>("translate")? != 0,
        target_languages,
        content_domain: row.try_get("content_domain")?,
        content_angle: row.try_get("content_angle")?,
        content_length: row.try_get("content_length")?,
        min_words: row.try_get::<i64, _>("min_words")? as u32,
        custom_instructions: row.try_get("custom_instructions")?,
        check_frequency,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        last_checked: row.try_get("last_checked")?,
        last_post_date: row.try_get("last_post_date")?,
        posts_today: row.try_get("posts_today")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
