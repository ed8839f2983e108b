use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use ai_client::{AiCallRecord, CallSink};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Index row for one recorded call.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CallSummary {
    pub call_id: String,
    pub timestamp: DateTime<Utc>,
    pub call_type: String,
    pub model: String,
    pub agent_name: String,
    pub session_id: String,
    pub total_tokens: i64,
    pub duration_ms: i64,
    pub error: Option<String>,
    pub log_shard: String,
}

#[derive(Debug, Clone, Default)]
pub struct CallFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub session_id: Option<String>,
    pub agent_name: Option<String>,
    pub call_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct AggregateReport {
    pub total_calls: i64,
    pub total_prompt_tokens: i64,
    pub total_completion_tokens: i64,
    pub total_tokens: i64,
    pub calls_by_type: HashMap<String, i64>,
    pub calls_by_agent: HashMap<String, i64>,
    pub calls_by_model: HashMap<String, i64>,
    pub avg_duration_ms: f64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SessionSummary {
    pub session_id: String,
    pub calls: i64,
    pub total_tokens: i64,
    pub first_call: DateTime<Utc>,
    pub last_call: DateTime<Utc>,
}

/// Append-only call recorder: JSONL shards + SQLite index.
pub struct Recorder {
    storage_path: PathBuf,
    pool: SqlitePool,
    /// Serializes shard append + index insert so concurrent writers cannot
    /// tear a record.
    write_lock: Mutex<()>,
}

impl Recorder {
    pub async fn open(storage_path: impl Into<PathBuf>) -> Result<Self> {
        let storage_path = storage_path.into();
        std::fs::create_dir_all(&storage_path)
            .with_context(|| format!("Failed to create telemetry dir: {}", storage_path.display()))?;

        let options = SqliteConnectOptions::new()
            .filename(storage_path.join("index.db"))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .context("Failed to open telemetry index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS call_index (
                call_id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                call_type TEXT NOT NULL,
                model TEXT NOT NULL,
                agent_name TEXT NOT NULL,
                session_id TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                error TEXT,
                log_shard TEXT NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await?;
        for ddl in [
            "CREATE INDEX IF NOT EXISTS idx_call_index_timestamp ON call_index(timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_call_index_session ON call_index(session_id)",
            "CREATE INDEX IF NOT EXISTS idx_call_index_agent ON call_index(agent_name)",
        ] {
            sqlx::query(ddl).execute(&pool).await?;
        }

        Ok(Self {
            storage_path,
            pool,
            write_lock: Mutex::new(()),
        })
    }

    fn shard_name(timestamp: &DateTime<Utc>) -> String {
        format!("calls-{}.jsonl", timestamp.format("%Y-%m-%d"))
    }

    /// Append one record: a single JSONL line plus one index insert.
    pub async fn append(&self, record: &AiCallRecord) -> Result<()> {
        let shard = Self::shard_name(&record.timestamp);
        let line = serde_json::to_string(record).context("Failed to serialize call record")?;
        let shard_path = self.storage_path.join(&shard);

        let _guard = self.write_lock.lock().await;

        let path = shard_path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open telemetry shard: {}", path.display()))?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
            Ok(())
        })
        .await
        .context("Telemetry shard writer panicked")??;

        sqlx::query(
            r#"
            INSERT INTO call_index
                (call_id, timestamp, call_type, model, agent_name, session_id,
                 prompt_tokens, completion_tokens, total_tokens, duration_ms, error, log_shard)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&record.call_id)
        .bind(record.timestamp)
        .bind(&record.call_type)
        .bind(&record.model)
        .bind(&record.agent_name)
        .bind(&record.session_id)
        .bind(record.token_usage.prompt_tokens as i64)
        .bind(record.token_usage.completion_tokens as i64)
        .bind(record.token_usage.total_tokens as i64)
        .bind(record.duration_ms)
        .bind(&record.error)
        .bind(&shard)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Query index rows, newest first.
    pub async fn query(
        &self,
        filter: &CallFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<CallSummary>> {
        let mut qb = QueryBuilder::new(
            "SELECT call_id, timestamp, call_type, model, agent_name, session_id, \
             total_tokens, duration_ms, error, log_shard FROM call_index WHERE 1=1",
        );
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY timestamp DESC LIMIT ");
        qb.push_bind(limit);
        qb.push(" OFFSET ");
        qb.push_bind(offset);

        let rows = qb.build_query_as::<CallSummary>().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    /// Load the full record from its shard. Returns `None` if the call is
    /// unknown or the shard no longer contains it.
    pub async fn get_full(&self, call_id: &str) -> Result<Option<AiCallRecord>> {
        let shard: Option<String> =
            sqlx::query_scalar("SELECT log_shard FROM call_index WHERE call_id = ?1")
                .bind(call_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some(shard) = shard else { return Ok(None) };

        let path = self.storage_path.join(shard);
        let call_id = call_id.to_string();
        let found = tokio::task::spawn_blocking(move || -> Result<Option<AiCallRecord>> {
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(_) => return Ok(None),
            };
            for line in content.lines() {
                match serde_json::from_str::<AiCallRecord>(line) {
                    Ok(record) if record.call_id == call_id => return Ok(Some(record)),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Skipping malformed telemetry line"),
                }
            }
            Ok(None)
        })
        .await
        .context("Telemetry shard reader panicked")??;

        Ok(found)
    }

    pub async fn aggregate(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        session_id: Option<String>,
    ) -> Result<AggregateReport> {
        let filter = CallFilter {
            start,
            end,
            session_id,
            ..Default::default()
        };

        let mut qb = QueryBuilder::new(
            "SELECT COUNT(*) AS total_calls, \
             COALESCE(SUM(prompt_tokens), 0) AS prompt_tokens, \
             COALESCE(SUM(completion_tokens), 0) AS completion_tokens, \
             COALESCE(SUM(total_tokens), 0) AS total_tokens, \
             COALESCE(AVG(duration_ms), 0.0) AS avg_duration_ms, \
             COALESCE(AVG(CASE WHEN error IS NULL THEN 0.0 ELSE 1.0 END), 0.0) AS error_rate \
             FROM call_index WHERE 1=1",
        );
        push_filter(&mut qb, &filter);
        let row = qb.build().fetch_one(&self.pool).await?;

        let mut report = AggregateReport {
            total_calls: row.get("total_calls"),
            total_prompt_tokens: row.get("prompt_tokens"),
            total_completion_tokens: row.get("completion_tokens"),
            total_tokens: row.get("total_tokens"),
            avg_duration_ms: row.get("avg_duration_ms"),
            error_rate: row.get("error_rate"),
            ..Default::default()
        };

        for (column, target) in [
            ("call_type", &mut report.calls_by_type),
            ("agent_name", &mut report.calls_by_agent),
            ("model", &mut report.calls_by_model),
        ] {
            let mut qb = QueryBuilder::new(format!(
                "SELECT {column} AS k, COUNT(*) AS n FROM call_index WHERE 1=1"
            ));
            push_filter(&mut qb, &filter);
            qb.push(format!(" GROUP BY {column}"));
            for row in qb.build().fetch_all(&self.pool).await? {
                target.insert(row.get("k"), row.get("n"));
            }
        }

        Ok(report)
    }

    pub async fn list_sessions(&self, limit: i64) -> Result<Vec<SessionSummary>> {
        let rows = sqlx::query_as::<_, SessionSummary>(
            r#"
            SELECT session_id,
                   COUNT(*) AS calls,
                   COALESCE(SUM(total_tokens), 0) AS total_tokens,
                   MIN(timestamp) AS first_call,
                   MAX(timestamp) AS last_call
            FROM call_index
            GROUP BY session_id
            ORDER BY last_call DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Delete shards (and their index rows) older than `retention_days`.
    /// Returns the number of index rows removed.
    pub async fn cleanup(&self, retention_days: i64) -> Result<u64> {
        let cutoff = Utc::now().date_naive() - chrono::Duration::days(retention_days);
        let mut deleted_rows = 0u64;

        let entries = std::fs::read_dir(&self.storage_path)
            .with_context(|| format!("Failed to list telemetry dir: {}", self.storage_path.display()))?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(date) = shard_date(&name) else { continue };
            if date < cutoff {
                let result = sqlx::query("DELETE FROM call_index WHERE log_shard = ?1")
                    .bind(&name)
                    .execute(&self.pool)
                    .await?;
                deleted_rows += result.rows_affected();
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    warn!(shard = name, error = %e, "Failed to delete telemetry shard");
                }
            }
        }

        if deleted_rows > 0 {
            info!(deleted_rows, retention_days, "Telemetry cleanup complete");
        }
        Ok(deleted_rows)
    }

    /// Export full matching records as JSONL. Returns the record count.
    pub async fn export_jsonl(&self, path: &Path, filter: &CallFilter) -> Result<u64> {
        let summaries = self.query(filter, i64::MAX, 0).await?;
        let mut count = 0u64;
        let mut out = std::fs::File::create(path)
            .with_context(|| format!("Failed to create export file: {}", path.display()))?;
        for summary in summaries {
            if let Some(record) = self.get_full(&summary.call_id).await? {
                let line = serde_json::to_string(&record)?;
                out.write_all(line.as_bytes())?;
                out.write_all(b"\n")?;
                count += 1;
            }
        }
        Ok(count)
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, sqlx::Sqlite>, filter: &CallFilter) {
    if let Some(start) = filter.start {
        qb.push(" AND timestamp >= ");
        qb.push_bind(start);
    }
    if let Some(end) = filter.end {
        qb.push(" AND timestamp <= ");
        qb.push_bind(end);
    }
    if let Some(session) = &filter.session_id {
        qb.push(" AND session_id = ");
        qb.push_bind(session.clone());
    }
    if let Some(agent) = &filter.agent_name {
        qb.push(" AND agent_name = ");
        qb.push_bind(agent.clone());
    }
    if let Some(call_type) = &filter.call_type {
        qb.push(" AND call_type = ");
        qb.push_bind(call_type.clone());
    }
}

fn shard_date(file_name: &str) -> Option<NaiveDate> {
    let date_part = file_name.strip_prefix("calls-")?.strip_suffix(".jsonl")?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

#[async_trait]
impl CallSink for Recorder {
    async fn record(&self, record: AiCallRecord) -> Result<()> {
        self.append(&record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ai_client::{CallParameters, ChatMessage};
    use briefwire_common::TokenUsage;

    fn sample_record(call_id: &str, agent: &str, session: &str) -> AiCallRecord {
        AiCallRecord {
            call_id: call_id.to_string(),
            timestamp: Utc::now(),
            call_type: "chat".to_string(),
            model: "test-model".to_string(),
            session_id: session.to_string(),
            agent_name: agent.to_string(),
            messages: vec![ChatMessage::user("hello")],
            parameters: CallParameters {
                max_tokens: 256,
                temperature: 0.7,
            },
            response: "hi".to_string(),
            parsed_json: None,
            token_usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 20,
                total_tokens: 30,
            },
            duration_ms: 42,
            retry_count: 0,
            error: None,
            caller: "test".to_string(),
        }
    }

    async fn recorder() -> (Recorder, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::open(dir.path()).await.unwrap();
        (recorder, dir)
    }

    #[tokio::test]
    async fn append_then_query_round_trips() {
        let (recorder, _dir) = recorder().await;
        recorder.append(&sample_record("c1", "collector", "s1")).await.unwrap();
        recorder.append(&sample_record("c2", "skeptic", "s1")).await.unwrap();

        let all = recorder.query(&CallFilter::default(), 10, 0).await.unwrap();
        assert_eq!(all.len(), 2);

        let filtered = recorder
            .query(
                &CallFilter {
                    agent_name: Some("skeptic".to_string()),
                    ..Default::default()
                },
                10,
                0,
            )
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].call_id, "c2");
    }

    #[tokio::test]
    async fn get_full_reads_the_shard() {
        let (recorder, _dir) = recorder().await;
        recorder.append(&sample_record("c1", "collector", "s1")).await.unwrap();

        let record = recorder.get_full("c1").await.unwrap().unwrap();
        assert_eq!(record.response, "hi");
        assert_eq!(record.token_usage.total_tokens, 30);
        assert!(recorder.get_full("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn aggregate_counts_and_groups() {
        let (recorder, _dir) = recorder().await;
        recorder.append(&sample_record("c1", "collector", "s1")).await.unwrap();
        recorder.append(&sample_record("c2", "collector", "s1")).await.unwrap();
        let mut failed = sample_record("c3", "skeptic", "s2");
        failed.error = Some("boom".to_string());
        failed.token_usage = TokenUsage::default();
        recorder.append(&failed).await.unwrap();

        let report = recorder.aggregate(None, None, None).await.unwrap();
        assert_eq!(report.total_calls, 3);
        assert_eq!(report.total_tokens, 60);
        assert_eq!(report.total_prompt_tokens + report.total_completion_tokens, 60);
        assert_eq!(report.calls_by_agent["collector"], 2);
        assert_eq!(report.calls_by_agent["skeptic"], 1);
        assert!((report.error_rate - 1.0 / 3.0).abs() < 1e-9);

        let scoped = recorder
            .aggregate(None, None, Some("s1".to_string()))
            .await
            .unwrap();
        assert_eq!(scoped.total_calls, 2);
        assert_eq!(scoped.error_rate, 0.0);
    }

    #[tokio::test]
    async fn list_sessions_orders_by_recency() {
        let (recorder, _dir) = recorder().await;
        recorder.append(&sample_record("c1", "a", "s1")).await.unwrap();
        recorder.append(&sample_record("c2", "a", "s2")).await.unwrap();

        let sessions = recorder.list_sessions(10).await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, "s2");
    }

    #[tokio::test]
    async fn cleanup_removes_old_shards() {
        let (recorder, dir) = recorder().await;
        let mut old = sample_record("c-old", "a", "s1");
        old.timestamp = Utc::now() - chrono::Duration::days(90);
        recorder.append(&old).await.unwrap();
        recorder.append(&sample_record("c-new", "a", "s1")).await.unwrap();

        let deleted = recorder.cleanup(30).await.unwrap();
        assert_eq!(deleted, 1);

        let remaining = recorder.query(&CallFilter::default(), 10, 0).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].call_id, "c-new");

        let shards: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("calls-"))
            .collect();
        assert_eq!(shards.len(), 1);
    }

    #[tokio::test]
    async fn export_writes_full_records() {
        let (recorder, dir) = recorder().await;
        recorder.append(&sample_record("c1", "a", "s1")).await.unwrap();
        recorder.append(&sample_record("c2", "b", "s1")).await.unwrap();

        let out = dir.path().join("export.jsonl");
        let count = recorder
            .export_jsonl(
                &out,
                &CallFilter {
                    agent_name: Some("a".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(count, 1);

        let content = std::fs::read_to_string(&out).unwrap();
        let record: AiCallRecord = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(record.call_id, "c1");
    }
}
