use anyhow::Result;
use briefwire_common::Article;
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tracing::info;

/// URL-keyed article persistence.
#[derive(Clone)]
pub struct ArticleStore {
    pool: SqlitePool,
}

/// A stored article with its row id and legacy enrichment columns.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ArticleRow {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub content: String,
    pub extracted_content: Option<String>,
    pub summary: String,
    pub source_name: String,
    pub category: String,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub overall_score: Option<f64>,
    pub analysis_summary: Option<String>,
    pub tags: Option<String>,
    pub analysis_json: Option<String>,
}

impl ArticleRow {
    pub fn into_article(self) -> Article {
        Article {
            url: self.url,
            title: self.title,
            content: self.content,
            extracted_content: self.extracted_content,
            summary: self.summary,
            source_name: self.source_name,
            category: self.category,
            author: self.author,
            published_at: self.published_at,
            fetched_at: self.fetched_at,
            sent_at: self.sent_at,
        }
    }
}

const SELECT_COLUMNS: &str = "id, url, title, content, extracted_content, summary, source_name, \
     category, author, published_at, fetched_at, sent_at, overall_score, analysis_summary, tags, \
     analysis_json";

impl ArticleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn exists(&self, url: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM articles WHERE url = ?1")
            .bind(url)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    /// Idempotent upsert keyed on URL. The first fetch time and any sent
    /// state are preserved; content fields refresh.
    pub async fn upsert(&self, article: &Article) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO articles
                (url, title, content, extracted_content, summary, source_name,
                 category, author, published_at, fetched_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(url) DO UPDATE SET
                title = excluded.title,
                content = excluded.content,
                extracted_content = COALESCE(excluded.extracted_content, articles.extracted_content),
                summary = excluded.summary,
                source_name = excluded.source_name,
                category = excluded.category,
                author = COALESCE(excluded.author, articles.author),
                published_at = COALESCE(excluded.published_at, articles.published_at)
            "#,
        )
        .bind(&article.url)
        .bind(&article.title)
        .bind(&article.content)
        .bind(&article.extracted_content)
        .bind(&article.summary)
        .bind(&article.source_name)
        .bind(&article.category)
        .bind(&article.author)
        .bind(article.published_at)
        .bind(article.fetched_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, url: &str) -> Result<Option<ArticleRow>> {
        let row = sqlx::query_as::<_, ArticleRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM articles WHERE url = ?1"
        ))
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_unsent(&self, limit: i64) -> Result<Vec<ArticleRow>> {
        let rows = sqlx::query_as::<_, ArticleRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM articles WHERE sent_at IS NULL \
             ORDER BY fetched_at DESC LIMIT ?1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Stamp `sent_at` on all given URLs in one transaction.
    pub async fn mark_sent(&self, urls: &[String]) -> Result<()> {
        if urls.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for url in urls {
            sqlx::query("UPDATE articles SET sent_at = ?1 WHERE url = ?2 AND sent_at IS NULL")
                .bind(now)
                .bind(url)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_recent_sent(&self, days: i64, limit: i64) -> Result<Vec<ArticleRow>> {
        let cutoff = Utc::now() - Duration::days(days);
        let rows = sqlx::query_as::<_, ArticleRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM articles WHERE sent_at >= ?1 \
             ORDER BY sent_at DESC LIMIT ?2"
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<ArticleRow>> {
        let rows = sqlx::query_as::<_, ArticleRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM articles ORDER BY fetched_at DESC LIMIT ?1 OFFSET ?2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM articles WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record the legacy article-centric analysis on the row.
    pub async fn record_analysis(
        &self,
        url: &str,
        overall_score: f64,
        summary: &str,
        tags: &[String],
        analysis_json: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE articles SET overall_score = ?1, analysis_summary = ?2, tags = ?3, \
             analysis_json = ?4 WHERE url = ?5",
        )
        .bind(overall_score)
        .bind(summary)
        .bind(serde_json::to_string(tags)?)
        .bind(serde_json::to_string(analysis_json)?)
        .bind(url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove articles older than the retention window, judged by publish
    /// time when present, fetch time otherwise.
    pub async fn cleanup(&self, retention_days: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(retention_days);
        let result = sqlx::query(
            "DELETE FROM articles WHERE COALESCE(published_at, fetched_at) < ?1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(deleted, retention_days, "Article retention sweep complete");
        }
        Ok(deleted)
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM articles")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
