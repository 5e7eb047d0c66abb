/// Conversation persistence operations
///
/// One row per inbound request, written once at request completion and never
/// updated. `method` and `tool_name` are stored as plain columns so the loop
/// detector can count with index range scans instead of parsing request blobs.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::{Executor, Row, SqlitePool};

use super::{from_millis, to_millis, RecordStatus};

/// Conversation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub conversation_id: String,
    pub session_id: String,
    pub sequence: i64,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub tool_name: Option<String>,
    pub request: Value,
    pub response: Value,
    pub task_id: Option<String>,
    pub status: RecordStatus,
}

/// Which rows to count in a window
#[derive(Debug, Clone, Copy)]
pub enum ConversationFilter<'a> {
    Any,
    Method(&'a str),
    Tool(&'a str),
}

/// Conversation repository for database operations
#[derive(Clone)]
pub struct ConversationRepository {
    pool: SqlitePool,
}

const SELECT_COLUMNS: &str = "SELECT conversation_id, session_id, sequence, timestamp_ms, method, \
     tool_name, request_data, response_data, task_id, status FROM conversations";

impl ConversationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a record on the pool
    pub async fn insert(&self, record: &ConversationRecord) -> Result<()> {
        Self::insert_with(&self.pool, record).await
    }

    /// Insert a record on any executor (pool or open transaction)
    pub async fn insert_with<'e, E>(executor: E, record: &ConversationRecord) -> Result<()>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let request = serde_json::to_string(&record.request)?;
        let response = serde_json::to_string(&record.response)?;

        sqlx::query(
            "INSERT INTO conversations \
             (conversation_id, session_id, sequence, timestamp, timestamp_ms, method, tool_name, \
              request_data, response_data, task_id, status) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.conversation_id)
        .bind(&record.session_id)
        .bind(record.sequence)
        .bind(record.timestamp.to_rfc3339())
        .bind(to_millis(record.timestamp))
        .bind(&record.method)
        .bind(&record.tool_name)
        .bind(request)
        .bind(response)
        .bind(&record.task_id)
        .bind(record.status.as_str())
        .execute(executor)
        .await
        .context("Failed to insert conversation record")?;

        Ok(())
    }

    /// Count a session's records strictly newer than `since`
    pub async fn count_since(
        &self,
        session_id: &str,
        since: DateTime<Utc>,
        filter: ConversationFilter<'_>,
    ) -> Result<i64> {
        let since_ms = to_millis(since);

        let count: i64 = match filter {
            ConversationFilter::Any => sqlx::query_scalar(
                "SELECT COUNT(*) FROM conversations WHERE session_id = ? AND timestamp_ms > ?",
            )
            .bind(session_id)
            .bind(since_ms)
            .fetch_one(&self.pool)
            .await,
            ConversationFilter::Method(method) => sqlx::query_scalar(
                "SELECT COUNT(*) FROM conversations \
                 WHERE session_id = ? AND method = ? AND timestamp_ms > ?",
            )
            .bind(session_id)
            .bind(method)
            .bind(since_ms)
            .fetch_one(&self.pool)
            .await,
            ConversationFilter::Tool(tool) => sqlx::query_scalar(
                "SELECT COUNT(*) FROM conversations \
                 WHERE session_id = ? AND tool_name = ? AND timestamp_ms > ?",
            )
            .bind(session_id)
            .bind(tool)
            .bind(since_ms)
            .fetch_one(&self.pool)
            .await,
        }
        .context("Failed to count conversations")?;

        Ok(count)
    }

    /// Substring search over stored requests and responses, newest first
    pub async fn search(
        &self,
        session_id: &str,
        query: &str,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ConversationRecord>> {
        let sql = format!(
            "{} WHERE session_id = ? AND timestamp_ms > ? \
             AND (instr(request_data, ?) > 0 OR instr(response_data, ?) > 0) \
             ORDER BY timestamp_ms DESC, sequence DESC LIMIT ?",
            SELECT_COLUMNS
        );

        let rows = sqlx::query(&sql)
            .bind(session_id)
            .bind(to_millis(since))
            .bind(query)
            .bind(query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to search conversations")?;

        rows.iter().map(row_to_record).collect()
    }

    /// Fetch a record by conversation id
    pub async fn get(&self, conversation_id: &str) -> Result<Option<ConversationRecord>> {
        let sql = format!("{} WHERE conversation_id = ?", SELECT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch conversation")?;

        row.as_ref().map(row_to_record).transpose()
    }

    /// Highest sequence number written for a session (0 when empty)
    pub async fn max_sequence(&self, session_id: &str) -> Result<i64> {
        let max: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence), 0) FROM conversations WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to read conversation sequence")?;

        Ok(max)
    }

    /// Record counts grouped by status
    pub async fn status_counts(&self, session_id: &str) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM conversations WHERE session_id = ? \
             GROUP BY status ORDER BY status",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to count conversations by status")?;

        Ok(rows)
    }

    /// Total count plus first and last activity time
    pub async fn activity_bounds(
        &self,
        session_id: &str,
    ) -> Result<(i64, Option<DateTime<Utc>>, Option<DateTime<Utc>>)> {
        let (count, min_ms, max_ms): (i64, Option<i64>, Option<i64>) = sqlx::query_as(
            "SELECT COUNT(*), MIN(timestamp_ms), MAX(timestamp_ms) \
             FROM conversations WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to read conversation bounds")?;

        Ok((count, min_ms.map(from_millis), max_ms.map(from_millis)))
    }
}

fn row_to_record(row: &SqliteRow) -> Result<ConversationRecord> {
    let request: String = row.get("request_data");
    let response: String = row.get("response_data");

    Ok(ConversationRecord {
        conversation_id: row.get("conversation_id"),
        session_id: row.get("session_id"),
        sequence: row.get("sequence"),
        timestamp: from_millis(row.get("timestamp_ms")),
        method: row.get("method"),
        tool_name: row.get("tool_name"),
        request: serde_json::from_str(&request).context("Corrupt request_data")?,
        response: serde_json::from_str(&response).context("Corrupt response_data")?,
        task_id: row.get("task_id"),
        status: RecordStatus::parse(&row.get::<String, _>("status")),
    })
}
