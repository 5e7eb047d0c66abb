/// Integration tests for the audit store
///
/// Tests the store lifecycle across reopen, session isolation inside one
/// database file, snapshot restore windows and workflow checkpoints.
use chrono::{Duration, Utc};
use saan_engine::conductor::CheckpointStore;
use saan_engine::db::{
    AuditStore, ConversationFilter, ConversationRecord, Database, RecordStatus, SnapshotEnvelope,
    SnapshotKind, TaskRecord,
};
use saan_sdk::GatewayError;
use serde_json::json;
use tempfile::TempDir;

fn conversation(session: &str, seq: i64, method: &str, tool: Option<&str>) -> ConversationRecord {
    ConversationRecord {
        conversation_id: format!("{}_CONV_{:06}", session, seq),
        session_id: session.to_string(),
        sequence: seq,
        timestamp: Utc::now(),
        method: method.to_string(),
        tool_name: tool.map(str::to_string),
        request: json!({"method": method, "params": {"name": tool}}),
        response: json!({"content": [{"type": "text", "text": format!("reply {}", seq)}]}),
        task_id: tool.map(|t| format!("{}_TASK_{:06}_{}", session, seq, t)),
        status: RecordStatus::Completed,
    }
}

fn task_for(conv: &ConversationRecord, status: RecordStatus) -> Option<TaskRecord> {
    let task_id = conv.task_id.clone()?;
    Some(TaskRecord {
        task_id,
        session_id: conv.session_id.clone(),
        sequence: conv.sequence,
        created_at: conv.timestamp,
        updated_at: conv.timestamp,
        task_type: conv.tool_name.clone().unwrap_or_default(),
        status,
        progress_data: json!({"conversation_id": conv.conversation_id}),
    })
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("audit").join("S1.db");

    let store = AuditStore::open(&path, "S1").await.unwrap();
    for seq in 1..=3 {
        let conv = conversation("S1", seq, "tools/call", Some("session_info"));
        store
            .record(&conv, task_for(&conv, RecordStatus::Completed).as_ref())
            .await
            .unwrap();
    }
    let conv = conversation("S1", 4, "tools/list", None);
    store.record(&conv, None).await.unwrap();
    store.close().await.unwrap();

    let store = AuditStore::open(&path, "S1").await.unwrap();
    assert_eq!(store.max_sequences().await.unwrap(), (4, 3));

    let stats = store.statistics().await.unwrap();
    assert_eq!(stats.total_conversations, 4);
    assert_eq!(stats.conversations_by_status.get("COMPLETED"), Some(&4));
    assert_eq!(stats.tasks_by_type.get("session_info"), Some(&3));
    assert!(stats.first_activity.is_some());
    assert!(stats.first_activity <= stats.last_activity);
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_sessions_are_isolated_in_one_file() {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(&temp_dir.path().join("shared.db")).await.unwrap();
    let db_b = Database::new(&temp_dir.path().join("shared.db")).await.unwrap();

    let a = AuditStore::with_database(db, "A");
    let b = AuditStore::with_database(db_b, "B");

    for seq in 1..=5 {
        let conv = conversation("A", seq, "tools/call", Some("remember_context"));
        a.record(&conv, task_for(&conv, RecordStatus::Completed).as_ref())
            .await
            .unwrap();
    }
    let conv = conversation("B", 1, "tools/call", Some("remember_context"));
    b.record(&conv, task_for(&conv, RecordStatus::Error).as_ref())
        .await
        .unwrap();

    let since = Utc::now() - Duration::minutes(1);
    let count_a = a
        .conversations()
        .count_since("A", since, ConversationFilter::Tool("remember_context"))
        .await
        .unwrap();
    let count_b = b
        .conversations()
        .count_since("B", since, ConversationFilter::Tool("remember_context"))
        .await
        .unwrap();
    assert_eq!(count_a, 5);
    assert_eq!(count_b, 1);

    let errors = b
        .task_history(None, Some(RecordStatus::Error), 10)
        .await
        .unwrap();
    assert_eq!(errors.len(), 1);
    assert!(a
        .task_history(None, Some(RecordStatus::Error), 10)
        .await
        .unwrap()
        .is_empty());

    let hits = a.search("reply 3", since, 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].conversation_id, "A_CONV_000003");
}

#[tokio::test]
async fn test_history_is_newest_first_and_limited() {
    let temp_dir = TempDir::new().unwrap();
    let store = AuditStore::open(&temp_dir.path().join("h.db"), "H")
        .await
        .unwrap();

    for (seq, tool) in [(1, "session_info"), (2, "agent_status"), (3, "session_info")] {
        let conv = conversation("H", seq, "tools/call", Some(tool));
        store
            .record(&conv, task_for(&conv, RecordStatus::Completed).as_ref())
            .await
            .unwrap();
    }

    let all = store.task_history(None, None, 2).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].sequence, 3);
    assert_eq!(all[1].sequence, 2);

    let typed = store
        .task_history(Some("session_info"), None, 10)
        .await
        .unwrap();
    assert_eq!(typed.len(), 2);
    assert!(typed.iter().all(|t| t.task_type == "session_info"));
}

#[tokio::test]
async fn test_restore_window_boundaries() {
    let temp_dir = TempDir::new().unwrap();
    let store = AuditStore::open(&temp_dir.path().join("r.db"), "R")
        .await
        .unwrap();
    let now = Utc::now();

    let payload = json!({"conversation_count": 7, "context_memory": {"k": "v"}});
    store
        .snapshot(
            SnapshotKind::Periodic,
            payload.clone(),
            json!({}),
            now - Duration::hours(2),
        )
        .await
        .unwrap();

    // Younger than max_age: payload comes back intact
    let restored = store.restore("R", Duration::hours(3), now).await.unwrap();
    assert_eq!(restored, payload);

    // Older than max_age: nothing, even though a row exists
    let err = store
        .restore("R", Duration::hours(1), now)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::SnapshotNotFound { max_age_secs: 3600, .. }
    ));

    // Other sessions never see R's snapshots
    assert!(store.restore("OTHER", Duration::hours(3), now).await.is_err());
}

#[tokio::test]
async fn test_restore_ignores_workflow_checkpoints() {
    let temp_dir = TempDir::new().unwrap();
    let store = AuditStore::open(&temp_dir.path().join("c.db"), "C")
        .await
        .unwrap();
    let now = Utc::now();

    store
        .snapshot(
            SnapshotKind::SessionStart,
            json!({"task_count": 1}),
            json!({}),
            now - Duration::minutes(5),
        )
        .await
        .unwrap();
    store
        .checkpoint("wf_1", json!({"progress": 0.4}), json!({"event": "step_started"}))
        .await
        .unwrap();

    let restored = store.restore("C", Duration::hours(1), now).await.unwrap();
    assert_eq!(restored, json!({"task_count": 1}));

    let checkpoints = store.checkpoints("wf_1").await.unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].kind, SnapshotKind::WorkflowCheckpoint);
    assert_eq!(checkpoints[0].workflow_id.as_deref(), Some("wf_1"));
    assert_eq!(checkpoints[0].metadata["event"], "step_started");
}

#[tokio::test]
async fn test_restore_refuses_other_schema_versions() {
    let temp_dir = TempDir::new().unwrap();
    let store = AuditStore::open(&temp_dir.path().join("v.db"), "V")
        .await
        .unwrap();
    let now = Utc::now();

    let envelope = SnapshotEnvelope {
        version: 2,
        ..SnapshotEnvelope::new(json!({"future": true}))
    };
    store
        .snapshots()
        .insert(
            "V",
            SnapshotKind::Periodic,
            None,
            &envelope,
            &json!({}),
            now - Duration::minutes(1),
        )
        .await
        .unwrap();

    let err = store.restore("V", Duration::hours(1), now).await.unwrap_err();
    assert!(matches!(
        err,
        GatewayError::SnapshotVersionMismatch {
            found: 2,
            expected: 1
        }
    ));
}

#[tokio::test]
async fn test_wal_flush_on_close() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("w.db");
    let store = AuditStore::open(&db_path, "W").await.unwrap();

    let conv = conversation("W", 1, "initialize", None);
    store.record(&conv, None).await.unwrap();
    store.flush().await.unwrap();
    assert_eq!(store.pending_writes().await, 0);
    store.close().await.unwrap();

    let wal_path = temp_dir.path().join("w.db-wal");
    let wal_size = std::fs::metadata(&wal_path).map(|m| m.len()).unwrap_or(0);
    assert_eq!(wal_size, 0, "WAL should be truncated after close");
}
