/// Database module for SQLite persistence
///
/// This module provides the audit store: conversation records, task records
/// and context snapshots for one session instance. It uses sqlx with WAL mode
/// so loop-detection and history reads can run alongside the single writer.
use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

pub mod audit;
pub mod conversations;
pub mod snapshots;
pub mod tasks;

// Re-export commonly used types
pub use audit::{AuditStore, SessionStatistics};
pub use conversations::{ConversationFilter, ConversationRecord, ConversationRepository};
pub use snapshots::{SnapshotEnvelope, SnapshotKind, SnapshotRecord, SnapshotRepository};
pub use tasks::{TaskRecord, TaskRepository};

/// Outcome recorded for conversations and tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordStatus {
    Completed,
    Error,
    Blocked,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Completed => "COMPLETED",
            RecordStatus::Error => "ERROR",
            RecordStatus::Blocked => "BLOCKED",
        }
    }

    /// Parse a stored status; unknown values read back as `Error`
    pub fn parse(value: &str) -> Self {
        match value {
            "COMPLETED" => RecordStatus::Completed,
            "BLOCKED" => RecordStatus::Blocked,
            _ => RecordStatus::Error,
        }
    }
}

impl FromStr for RecordStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "COMPLETED" => Ok(RecordStatus::Completed),
            "ERROR" => Ok(RecordStatus::Error),
            "BLOCKED" => Ok(RecordStatus::Blocked),
            other => Err(anyhow::anyhow!("unknown record status: {}", other)),
        }
    }
}

/// `hours` as a span, if chrono can represent it
pub fn hours_span(hours: u64) -> Option<TimeDelta> {
    i64::try_from(hours).ok().and_then(TimeDelta::try_hours)
}

/// `seconds` as a span, if chrono can represent it
pub fn seconds_span(seconds: u64) -> Option<TimeDelta> {
    i64::try_from(seconds).ok().and_then(TimeDelta::try_seconds)
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    ///
    /// This will:
    /// 1. Create the database file if it doesn't exist
    /// 2. Enable WAL mode so readers don't block the writer
    /// 3. Run migrations to set up the schema
    pub async fn new(db_path: &Path) -> Result<Self> {
        info!("Initializing audit store at: {}", db_path.display());

        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        let connection_string = format!("sqlite:{}", db_path.display());
        let options = SqliteConnectOptions::from_str(&connection_string)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // A restarted gateway may still share the file with the old pool
            .busy_timeout(Duration::from_secs(5))
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        debug!("Database connection established");

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run database migrations
    ///
    /// Migrations are idempotent and can be run multiple times safely.
    async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::raw_sql(include_str!("../../migrations/001_initial.sql"))
            .execute(&self.pool)
            .await
            .context("Failed to execute migration 001_initial.sql")?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Flush the WAL to disk
    pub async fn flush_wal(&self) -> Result<()> {
        info!("Flushing WAL to disk");

        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .context("Failed to flush WAL")?;

        debug!("WAL flushed successfully");
        Ok(())
    }

    /// Flush the WAL and close all connections in the pool
    pub async fn close(self) -> Result<()> {
        info!("Closing database connection");

        self.flush_wal().await?;
        self.pool.close().await;

        info!("Database connection closed");
        Ok(())
    }

    pub fn conversations(&self) -> ConversationRepository {
        ConversationRepository::new(self.pool.clone())
    }

    pub fn tasks(&self) -> TaskRepository {
        TaskRepository::new(self.pool.clone())
    }

    pub fn snapshots(&self) -> SnapshotRepository {
        SnapshotRepository::new(self.pool.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_database_creation() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("audit.db");

        let db = Database::new(&db_path).await.unwrap();
        assert!(db_path.exists());

        let result = sqlx::query("SELECT 1").fetch_one(db.pool()).await;
        assert!(result.is_ok());

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_migrations_create_tables_and_indexes() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("audit.db"))
            .await
            .unwrap();

        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .fetch_all(db.pool())
                .await
                .unwrap();

        assert!(tables.contains(&"conversations".to_string()));
        assert!(tables.contains(&"task_tracking".to_string()));
        assert!(tables.contains(&"context_snapshots".to_string()));

        let indexes: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type='index' AND name LIKE 'idx_%' ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();

        assert!(indexes.contains(&"idx_conversations_session_method_time".to_string()));
        assert!(indexes.contains(&"idx_conversations_session_tool_time".to_string()));

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("audit.db");

        let db = Database::new(&path).await.unwrap();
        db.close().await.unwrap();

        let db = Database::new(&path).await.unwrap();
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_wal_mode_enabled() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("audit.db"))
            .await
            .unwrap();

        let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(db.pool())
            .await
            .unwrap();

        assert_eq!(journal_mode.to_lowercase(), "wal");
        db.close().await.unwrap();
    }

    #[test]
    fn test_record_status_strings() {
        for status in [
            RecordStatus::Completed,
            RecordStatus::Error,
            RecordStatus::Blocked,
        ] {
            assert_eq!(RecordStatus::parse(status.as_str()), status);
            assert_eq!(status.as_str().parse::<RecordStatus>().unwrap(), status);
        }
        assert!("nope".parse::<RecordStatus>().is_err());
    }

    #[test]
    fn test_spans_refuse_unrepresentable_values() {
        assert_eq!(hours_span(2), Some(TimeDelta::hours(2)));
        assert_eq!(seconds_span(300), Some(TimeDelta::seconds(300)));
        assert!(hours_span(10_000_000_000_000).is_none());
        assert!(hours_span(u64::MAX).is_none());
        assert!(seconds_span(u64::MAX).is_none());
    }

    #[test]
    fn test_millis_round_trip() {
        let now = Utc::now();
        let back = from_millis(to_millis(now));
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }
}
