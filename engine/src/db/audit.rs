/// Audit store facade
///
/// Binds the three repositories to one session and adds the behaviour the
/// gateway relies on: transactional conversation+task writes, a bounded
/// retry queue for writes that failed while the store was unreachable,
/// bounded-age restore, and aggregate statistics.
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use saan_sdk::GatewayError;
use serde::Serialize;
use serde_json::Value;
use sqlx::error::ErrorKind;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{
    ConversationRecord, ConversationRepository, Database, SnapshotEnvelope, SnapshotKind,
    SnapshotRecord, SnapshotRepository, TaskRecord, TaskRepository,
};
use crate::conductor::CheckpointStore;

/// Writes held back while the store is failing
const MAX_PENDING_WRITES: usize = 256;

type PendingWrite = (ConversationRecord, Option<TaskRecord>);

/// Aggregate view over one session's audit trail
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatistics {
    pub session_id: String,
    pub total_conversations: i64,
    pub conversations_by_status: BTreeMap<String, i64>,
    pub tasks_by_type: BTreeMap<String, i64>,
    pub snapshots: i64,
    pub first_activity: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Session-scoped audit store
pub struct AuditStore {
    db: Database,
    session_id: String,
    conversations: ConversationRepository,
    tasks: TaskRepository,
    snapshots: SnapshotRepository,
    pending: Mutex<VecDeque<PendingWrite>>,
}

impl AuditStore {
    /// Open (or create) the audit database for a session
    pub async fn open(path: &Path, session_id: impl Into<String>) -> Result<Self> {
        let db = Database::new(path).await?;
        Ok(Self::with_database(db, session_id))
    }

    pub fn with_database(db: Database, session_id: impl Into<String>) -> Self {
        Self {
            conversations: db.conversations(),
            tasks: db.tasks(),
            snapshots: db.snapshots(),
            db,
            session_id: session_id.into(),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn conversations(&self) -> &ConversationRepository {
        &self.conversations
    }

    pub fn tasks(&self) -> &TaskRepository {
        &self.tasks
    }

    pub fn snapshots(&self) -> &SnapshotRepository {
        &self.snapshots
    }

    /// Persist a conversation and its task in one transaction
    ///
    /// Writes queued by earlier failures are flushed first so records land in
    /// order. If this write fails while the store is unreachable it joins the
    /// queue; a write the database refuses outright (a constraint violation)
    /// is dropped instead. Either way the error is returned for the caller
    /// to log.
    pub async fn record(
        &self,
        conversation: &ConversationRecord,
        task: Option<&TaskRecord>,
    ) -> Result<()> {
        let mut pending = self.pending.lock().await;

        if let Err(e) = self.drain(&mut pending).await {
            debug!("Audit store still unavailable: {:#}", e);
            Self::enqueue(&mut pending, conversation.clone(), task.cloned());
            return Err(e);
        }

        if let Err(e) = self.write(conversation, task).await {
            if is_permanent(&e) {
                error!(
                    "Audit store refused {}, not retrying: {:#}",
                    conversation.conversation_id, e
                );
            } else {
                Self::enqueue(&mut pending, conversation.clone(), task.cloned());
            }
            return Err(e);
        }

        Ok(())
    }

    /// Retry queued writes and checkpoint the WAL
    pub async fn flush(&self) -> Result<()> {
        {
            let mut pending = self.pending.lock().await;
            self.drain(&mut pending).await?;
        }
        self.db.flush_wal().await
    }

    /// Write queued records oldest first
    ///
    /// Stops at the first transient failure. Records the database refuses
    /// are dropped so they never hold back the ones behind them.
    async fn drain(&self, pending: &mut VecDeque<PendingWrite>) -> Result<()> {
        while let Some((queued_conv, queued_task)) = pending.front() {
            match self.write(queued_conv, queued_task.as_ref()).await {
                Ok(()) => {}
                Err(e) if is_permanent(&e) => {
                    error!(
                        "Dropping queued record {}: {:#}",
                        queued_conv.conversation_id, e
                    );
                }
                Err(e) => return Err(e),
            }
            pending.pop_front();
        }
        Ok(())
    }

    /// Number of writes waiting for the store to recover
    pub async fn pending_writes(&self) -> usize {
        self.pending.lock().await.len()
    }

    fn enqueue(
        pending: &mut VecDeque<PendingWrite>,
        conversation: ConversationRecord,
        task: Option<TaskRecord>,
    ) {
        if pending.len() >= MAX_PENDING_WRITES {
            if let Some((dropped, _)) = pending.pop_front() {
                error!(
                    "Audit queue full, dropping record {}",
                    dropped.conversation_id
                );
            }
        }
        pending.push_back((conversation, task));
    }

    async fn write(&self, conversation: &ConversationRecord, task: Option<&TaskRecord>) -> Result<()> {
        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .context("Failed to begin audit transaction")?;

        ConversationRepository::insert_with(&mut *tx, conversation).await?;
        if let Some(task) = task {
            TaskRepository::upsert_with(&mut *tx, task).await?;
        }

        tx.commit()
            .await
            .context("Failed to commit audit transaction")?;

        debug!("Recorded {}", conversation.conversation_id);
        Ok(())
    }

    /// Append a session snapshot
    pub async fn snapshot(
        &self,
        kind: SnapshotKind,
        payload: Value,
        metadata: Value,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        let id = self
            .snapshots
            .insert(
                &self.session_id,
                kind,
                None,
                &SnapshotEnvelope::new(payload),
                &metadata,
                at,
            )
            .await?;

        info!("Saved {} snapshot #{}", kind.as_str(), id);
        Ok(id)
    }

    /// Time of the newest restorable snapshot for this session
    pub async fn last_snapshot_at(&self) -> Result<Option<DateTime<Utc>>> {
        self.snapshots.last_session_snapshot_at(&self.session_id).await
    }

    /// Newest snapshot strictly younger than `max_age`
    ///
    /// Never falls back to an older row. A `max_age` reaching past the
    /// representable calendar is rejected as invalid params.
    pub async fn restore(
        &self,
        session_id: &str,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> std::result::Result<Value, GatewayError> {
        let cutoff = now.checked_sub_signed(max_age).ok_or_else(|| {
            GatewayError::InvalidParams(format!(
                "restore window of {}h is out of range",
                max_age.num_hours()
            ))
        })?;

        let found = self
            .snapshots
            .latest_restorable(session_id, cutoff)
            .await
            .map_err(|e| GatewayError::StoreUnavailable(format!("{:#}", e)))?;

        let Some(record) = found else {
            return Err(GatewayError::SnapshotNotFound {
                session_id: session_id.to_string(),
                max_age_secs: max_age.num_seconds().max(0) as u64,
            });
        };

        info!(
            "Restoring {} snapshot #{} from {}",
            record.kind.as_str(),
            record.id,
            record.snapshot_time
        );
        record.envelope.into_payload()
    }

    pub async fn search(
        &self,
        query: &str,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ConversationRecord>> {
        self.conversations
            .search(&self.session_id, query, since, limit)
            .await
    }

    pub async fn task_history(
        &self,
        task_type: Option<&str>,
        status: Option<super::RecordStatus>,
        limit: i64,
    ) -> Result<Vec<TaskRecord>> {
        self.tasks
            .history(&self.session_id, task_type, status, limit)
            .await
    }

    pub async fn statistics(&self) -> Result<SessionStatistics> {
        let (total, first, last) = self
            .conversations
            .activity_bounds(&self.session_id)
            .await?;
        let by_status = self.conversations.status_counts(&self.session_id).await?;
        let by_type = self.tasks.type_counts(&self.session_id).await?;
        let snapshots = self.snapshots.count(&self.session_id).await?;

        Ok(SessionStatistics {
            session_id: self.session_id.clone(),
            total_conversations: total,
            conversations_by_status: by_status.into_iter().collect(),
            tasks_by_type: by_type.into_iter().collect(),
            snapshots,
            first_activity: first,
            last_activity: last,
        })
    }

    /// Highest conversation and task sequence numbers already on disk
    pub async fn max_sequences(&self) -> Result<(u64, u64)> {
        let conv = self.conversations.max_sequence(&self.session_id).await?;
        let task = self.tasks.max_sequence(&self.session_id).await?;
        Ok((conv.max(0) as u64, task.max(0) as u64))
    }

    /// Workflow checkpoints in write order
    pub async fn checkpoints(&self, workflow_id: &str) -> Result<Vec<SnapshotRecord>> {
        self.snapshots.for_workflow(workflow_id).await
    }

    /// Flush the WAL and close the pool
    pub async fn close(self) -> Result<()> {
        let pending = self.pending.lock().await.len();
        if pending > 0 {
            warn!("Closing audit store with {} unwritten records", pending);
        }
        self.db.close().await
    }
}

/// A write the database rejects on its merits, so retrying cannot help
fn is_permanent(e: &anyhow::Error) -> bool {
    match e.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::Database(db)) => !matches!(db.kind(), ErrorKind::Other),
        _ => false,
    }
}

#[async_trait]
impl CheckpointStore for AuditStore {
    async fn checkpoint(&self, workflow_id: &str, state: Value, metadata: Value) -> Result<()> {
        self.snapshots
            .insert(
                &self.session_id,
                SnapshotKind::WorkflowCheckpoint,
                Some(workflow_id),
                &SnapshotEnvelope::new(state),
                &metadata,
                Utc::now(),
            )
            .await?;
        Ok(())
    }
}
