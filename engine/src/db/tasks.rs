/// Task persistence operations
///
/// A task record is written for every dispatchable unit of work: a tool call
/// or a workflow step. Records are upserted by `task_id` so a retried write
/// after a store outage lands on the same row with a newer `updated_at`.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::{Executor, Row, SqlitePool};

use super::{from_millis, to_millis, RecordStatus};

/// Task record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub session_id: String,
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub task_type: String,
    pub status: RecordStatus,
    pub progress_data: Value,
}

/// Task repository for database operations
#[derive(Clone)]
pub struct TaskRepository {
    pool: SqlitePool,
}

impl TaskRepository {
    /// Create a new task repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, record: &TaskRecord) -> Result<()> {
        Self::upsert_with(&self.pool, record).await
    }

    /// Insert a task or refresh its status, progress and `updated_at`
    pub async fn upsert_with<'e, E>(executor: E, record: &TaskRecord) -> Result<()>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let progress = serde_json::to_string(&record.progress_data)?;

        sqlx::query(
            "INSERT INTO task_tracking \
             (task_id, session_id, sequence, created_at, created_at_ms, updated_at, task_type, \
              status, progress_data) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(task_id) DO UPDATE SET \
               updated_at = excluded.updated_at, \
               status = excluded.status, \
               progress_data = excluded.progress_data",
        )
        .bind(&record.task_id)
        .bind(&record.session_id)
        .bind(record.sequence)
        .bind(record.created_at.to_rfc3339())
        .bind(to_millis(record.created_at))
        .bind(record.updated_at.to_rfc3339())
        .bind(&record.task_type)
        .bind(record.status.as_str())
        .bind(progress)
        .execute(executor)
        .await
        .context("Failed to upsert task record")?;

        Ok(())
    }

    /// Get a task by ID
    pub async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let row = sqlx::query(
            "SELECT task_id, session_id, sequence, created_at_ms, updated_at, task_type, status, \
             progress_data FROM task_tracking WHERE task_id = ?",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch task")?;

        row.as_ref().map(row_to_task).transpose()
    }

    /// Task records newest first, optionally narrowed by type and status
    pub async fn history(
        &self,
        session_id: &str,
        task_type: Option<&str>,
        status: Option<RecordStatus>,
        limit: i64,
    ) -> Result<Vec<TaskRecord>> {
        let status = status.map(|s| s.as_str());

        let rows = sqlx::query(
            "SELECT task_id, session_id, sequence, created_at_ms, updated_at, task_type, status, \
             progress_data FROM task_tracking \
             WHERE session_id = ? \
               AND (? IS NULL OR task_type = ?) \
               AND (? IS NULL OR status = ?) \
             ORDER BY created_at_ms DESC, sequence DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(task_type)
        .bind(task_type)
        .bind(status)
        .bind(status)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch task history")?;

        rows.iter().map(row_to_task).collect()
    }

    /// Task counts grouped by type
    pub async fn type_counts(&self, session_id: &str) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT task_type, COUNT(*) FROM task_tracking WHERE session_id = ? \
             GROUP BY task_type ORDER BY task_type",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to count tasks by type")?;

        Ok(rows)
    }

    /// Highest sequence number written for a session (0 when empty)
    pub async fn max_sequence(&self, session_id: &str) -> Result<i64> {
        let max: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence), 0) FROM task_tracking WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to read task sequence")?;

        Ok(max)
    }
}

fn row_to_task(row: &SqliteRow) -> Result<TaskRecord> {
    let updated_at: String = row.get("updated_at");
    let progress: String = row.get("progress_data");

    Ok(TaskRecord {
        task_id: row.get("task_id"),
        session_id: row.get("session_id"),
        sequence: row.get("sequence"),
        created_at: from_millis(row.get("created_at_ms")),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .context("Corrupt updated_at")?
            .with_timezone(&Utc),
        task_type: row.get("task_type"),
        status: RecordStatus::parse(&row.get::<String, _>("status")),
        progress_data: serde_json::from_str(&progress).context("Corrupt progress_data")?,
    })
}
