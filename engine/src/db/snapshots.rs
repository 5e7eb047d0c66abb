/// Context snapshot persistence
///
/// Snapshots are append-only. The payload is wrapped in a versioned envelope
/// and stored as a JSON blob; restoring an envelope written by a different
/// schema version is refused rather than guessed at.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use saan_sdk::GatewayError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{from_millis, to_millis};

/// Envelope schema name
pub const SNAPSHOT_SCHEMA: &str = "saan.context";

/// Current envelope version
pub const SNAPSHOT_VERSION: u32 = 1;

/// What triggered a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    SessionStart,
    Periodic,
    WorkflowCheckpoint,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::SessionStart => "session_start",
            SnapshotKind::Periodic => "periodic",
            SnapshotKind::WorkflowCheckpoint => "workflow_checkpoint",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "session_start" => Some(SnapshotKind::SessionStart),
            "periodic" => Some(SnapshotKind::Periodic),
            "workflow_checkpoint" => Some(SnapshotKind::WorkflowCheckpoint),
            _ => None,
        }
    }
}

/// Versioned snapshot payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEnvelope {
    pub schema: String,
    pub version: u32,
    pub payload: Value,
}

impl SnapshotEnvelope {
    /// Wrap a payload at the current version
    pub fn new(payload: Value) -> Self {
        Self {
            schema: SNAPSHOT_SCHEMA.to_string(),
            version: SNAPSHOT_VERSION,
            payload,
        }
    }

    /// Unwrap the payload, refusing envelopes from another version
    pub fn into_payload(self) -> std::result::Result<Value, GatewayError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(GatewayError::SnapshotVersionMismatch {
                found: self.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        Ok(self.payload)
    }
}

/// Snapshot row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: i64,
    pub session_id: String,
    pub snapshot_time: DateTime<Utc>,
    pub kind: SnapshotKind,
    pub workflow_id: Option<String>,
    pub envelope: SnapshotEnvelope,
    pub metadata: Value,
}

const SELECT_COLUMNS: &str = "SELECT id, session_id, snapshot_time_ms, snapshot_type, workflow_id, \
     context_data, metadata FROM context_snapshots";

/// Snapshot repository for database operations
#[derive(Clone)]
pub struct SnapshotRepository {
    pool: SqlitePool,
}

impl SnapshotRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a snapshot and return its row id
    pub async fn insert(
        &self,
        session_id: &str,
        kind: SnapshotKind,
        workflow_id: Option<&str>,
        envelope: &SnapshotEnvelope,
        metadata: &Value,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        let blob = serde_json::to_vec(envelope)?;
        let metadata = serde_json::to_string(metadata)?;

        let result = sqlx::query(
            "INSERT INTO context_snapshots \
             (session_id, snapshot_time, snapshot_time_ms, snapshot_type, schema_version, \
              workflow_id, context_data, metadata) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(at.to_rfc3339())
        .bind(to_millis(at))
        .bind(kind.as_str())
        .bind(envelope.version as i64)
        .bind(workflow_id)
        .bind(blob)
        .bind(metadata)
        .execute(&self.pool)
        .await
        .context("Failed to insert context snapshot")?;

        Ok(result.last_insert_rowid())
    }

    /// Newest session snapshot taken strictly after `since`
    pub async fn latest_restorable(
        &self,
        session_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<SnapshotRecord>> {
        let sql = format!(
            "{} WHERE session_id = ? AND snapshot_type IN ('session_start', 'periodic') \
             AND snapshot_time_ms > ? ORDER BY snapshot_time_ms DESC, id DESC LIMIT 1",
            SELECT_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(session_id)
            .bind(to_millis(since))
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch latest snapshot")?;

        row.as_ref().map(row_to_snapshot).transpose()
    }

    /// Time of the newest session snapshot, if any
    pub async fn last_session_snapshot_at(&self, session_id: &str) -> Result<Option<DateTime<Utc>>> {
        let ms: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(snapshot_time_ms) FROM context_snapshots \
             WHERE session_id = ? AND snapshot_type IN ('session_start', 'periodic')",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to read snapshot time")?;

        Ok(ms.map(from_millis))
    }

    /// Workflow checkpoints in write order
    pub async fn for_workflow(&self, workflow_id: &str) -> Result<Vec<SnapshotRecord>> {
        let sql = format!(
            "{} WHERE snapshot_type = 'workflow_checkpoint' AND workflow_id = ? ORDER BY id",
            SELECT_COLUMNS
        );

        let rows = sqlx::query(&sql)
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch workflow checkpoints")?;

        rows.iter().map(row_to_snapshot).collect()
    }

    pub async fn count(&self, session_id: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM context_snapshots WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(&self.pool)
                .await
                .context("Failed to count snapshots")?;

        Ok(count)
    }
}

fn row_to_snapshot(row: &SqliteRow) -> Result<SnapshotRecord> {
    let kind: String = row.get("snapshot_type");
    let blob: Vec<u8> = row.get("context_data");
    let metadata: String = row.get("metadata");

    Ok(SnapshotRecord {
        id: row.get("id"),
        session_id: row.get("session_id"),
        snapshot_time: from_millis(row.get("snapshot_time_ms")),
        kind: SnapshotKind::parse(&kind)
            .with_context(|| format!("Unknown snapshot type: {}", kind))?,
        workflow_id: row.get("workflow_id"),
        envelope: serde_json::from_slice(&blob).context("Corrupt snapshot envelope")?,
        metadata: serde_json::from_str(&metadata).context("Corrupt snapshot metadata")?,
    })
}
