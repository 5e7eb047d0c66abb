//! Gateway session
//!
//! One `Session` per gateway process. It owns the audit store, the risk gate
//! and the loop detector, and it is the single writer for the session's
//! counters: conversation and task ids are allocated and written inside one
//! mutex region so ids are dense and never reused.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use saan_sdk::types::is_error_response;
use saan_sdk::{GatewayError, RiskAssessment, RpcRequest};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{AuditConfig, GateConfig};
use crate::db::{
    hours_span, seconds_span, AuditStore, ConversationFilter, ConversationRecord, RecordStatus,
    SnapshotKind, TaskRecord,
};
use crate::loop_detector::{LoopDetector, LoopLimits, LoopVerdict};
use crate::risk_assessor::RiskAssessor;

/// `SESSION_{yyyymmdd}_{sha256(env)[..12]}`
///
/// The hash covers the process id, user, shell, terminal and working
/// directory, so concurrent gateways in different terminals never share an id.
pub fn derive_session_id(now: DateTime<Utc>) -> String {
    let env = json!({
        "cwd": std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        "pid": std::process::id(),
        "shell": std::env::var("SHELL").unwrap_or_else(|_| "unknown".into()),
        "term": std::env::var("TERM").unwrap_or_else(|_| "unknown".into()),
        "user": std::env::var("USER").unwrap_or_else(|_| "unknown".into()),
    });

    let digest = Sha256::digest(env.to_string().as_bytes());
    let hash = hex::encode(digest);

    format!("SESSION_{}_{}", now.format("%Y%m%d"), &hash[..12])
}

/// Ids attached to a completed request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tracking {
    pub conversation_id: String,
    pub task_id: Option<String>,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
}

impl Tracking {
    pub fn to_value(&self) -> Value {
        json!({
            "conversation_id": self.conversation_id,
            "task_id": self.task_id,
            "session_id": self.session_id,
            "timestamp": self.timestamp.to_rfc3339(),
        })
    }
}

/// A request on its way to the audit trail
#[derive(Debug, Clone)]
pub struct Completion {
    pub method: String,
    pub tool_name: Option<String>,
    /// Work item for the task id; `None` means no task record
    pub work_item: Option<String>,
    pub request: Value,
    pub blocked: bool,
    pub timestamp: DateTime<Utc>,
    started: Instant,
}

impl Completion {
    pub fn new(request: &RpcRequest, timestamp: DateTime<Utc>) -> Self {
        let tool_name = match request.method.as_str() {
            "tools/call" => Some(request.tool_name().unwrap_or("unknown").to_string()),
            _ => None,
        };

        Self {
            method: request.method.clone(),
            work_item: tool_name.clone(),
            tool_name,
            request: request.to_value(),
            blocked: false,
            timestamp,
            started: Instant::now(),
        }
    }

    /// Record a task named after `work_item`
    pub fn with_work_item(mut self, work_item: impl Into<String>) -> Self {
        self.work_item = Some(work_item.into());
        self
    }

    pub fn blocked(mut self) -> Self {
        self.blocked = true;
        self
    }
}

/// Running request metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceMetrics {
    pub total_requests: u64,
    pub successful_operations: u64,
    pub blocked_operations: u64,
    pub failed_operations: u64,
    pub average_response_time_ms: f64,
}

impl PerformanceMetrics {
    fn observe(&mut self, status: RecordStatus, elapsed_ms: f64) {
        self.total_requests += 1;
        match status {
            RecordStatus::Completed => self.successful_operations += 1,
            RecordStatus::Blocked => self.blocked_operations += 1,
            RecordStatus::Error => self.failed_operations += 1,
        }
        let n = self.total_requests as f64;
        self.average_response_time_ms += (elapsed_ms - self.average_response_time_ms) / n;
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.successful_operations as f64 / self.total_requests as f64
    }
}

/// Session context captured in snapshots
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionContext {
    pub conversation_count: u64,
    pub task_count: u64,
    pub performance_metrics: PerformanceMetrics,
    pub context_memory: Map<String, Value>,
}

#[derive(Debug, Default)]
struct Tracker {
    context: SessionContext,
    last_snapshot: Option<DateTime<Utc>>,
}

impl Tracker {
    /// Fold a restored context in without moving counters backwards
    fn merge(&mut self, restored: SessionContext) {
        self.context.conversation_count = self
            .context
            .conversation_count
            .max(restored.conversation_count);
        self.context.task_count = self.context.task_count.max(restored.task_count);
        self.context.context_memory.extend(restored.context_memory);
    }
}

pub struct Session {
    session_id: String,
    started_at: DateTime<Utc>,
    store: Arc<AuditStore>,
    assessor: RiskAssessor,
    gate: GateConfig,
    detector: LoopDetector,
    audit: AuditConfig,
    tracker: Mutex<Tracker>,
}

impl Session {
    /// Seed counters from disk, restore recent context and mark the start
    pub async fn open(
        store: Arc<AuditStore>,
        gate: GateConfig,
        loop_limits: LoopLimits,
        audit: AuditConfig,
    ) -> Result<Self> {
        let session_id = store.session_id().to_string();
        let started_at = Utc::now();
        let (conversations, tasks) = store.max_sequences().await?;

        let mut tracker = Tracker::default();
        tracker.context.conversation_count = conversations;
        tracker.context.task_count = tasks;

        let max_age = hours_span(audit.restore_max_age_hours).unwrap_or(Duration::MAX);
        match store.restore(&session_id, max_age, started_at).await {
            Ok(payload) => match serde_json::from_value::<SessionContext>(payload) {
                Ok(restored) => {
                    info!(
                        "Restored previous context: {} memory entries",
                        restored.context_memory.len()
                    );
                    tracker.merge(restored);
                }
                Err(e) => warn!("Ignoring unreadable snapshot payload: {}", e),
            },
            Err(GatewayError::SnapshotNotFound { .. }) => {
                debug!("No recent context for {}", session_id)
            }
            Err(e) => warn!("Context restore failed: {}", e),
        }

        let detector = LoopDetector::new(store.conversations().clone(), loop_limits);
        let session = Self {
            session_id,
            started_at,
            assessor: RiskAssessor::with_rules(gate.rules.clone()),
            gate,
            detector,
            audit,
            store,
            tracker: Mutex::new(tracker),
        };

        {
            let mut tracker = session.tracker.lock().await;
            session
                .save_snapshot(&mut tracker, SnapshotKind::SessionStart, started_at)
                .await;
        }

        info!("Session {} started", session.session_id);
        Ok(session)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn store(&self) -> &Arc<AuditStore> {
        &self.store
    }

    pub fn loop_limits(&self) -> &LoopLimits {
        self.detector.limits()
    }

    /// Assessment of a request that must be rejected, if any
    pub fn gate(&self, method: &str, params: &Value) -> Option<RiskAssessment> {
        if !self.gate.enabled {
            return None;
        }

        let assessment = self.assessor.assess(method, params);
        debug!(
            "Risk {} for {}: {}",
            assessment.level.as_str(),
            method,
            assessment.total
        );

        if RiskAssessor::exceeds(&assessment, self.gate.block_threshold) {
            warn!(
                "Blocking {}: risk {} >= {}",
                method, assessment.total, self.gate.block_threshold
            );
            Some(assessment)
        } else {
            None
        }
    }

    pub async fn loop_check(&self, method: &str, params: &Value, now: DateTime<Utc>) -> LoopVerdict {
        self.detector
            .check(&self.session_id, method, params, now)
            .await
    }

    /// Allocate ids, build the response and persist the audit record
    ///
    /// Everything happens under the session lock, so records are written in
    /// id order even when workflow steps complete concurrently with requests.
    /// A failed write is logged and queued by the store; the response is
    /// still returned.
    pub async fn commit<F>(&self, entry: Completion, respond: F) -> Value
    where
        F: FnOnce(&Tracking) -> Value,
    {
        let mut tracker = self.tracker.lock().await;

        tracker.context.conversation_count += 1;
        let sequence = tracker.context.conversation_count;
        let conversation_id = format!("{}_CONV_{:06}", self.session_id, sequence);

        let task = entry.work_item.as_ref().map(|item| {
            tracker.context.task_count += 1;
            (
                tracker.context.task_count,
                format!(
                    "{}_TASK_{:06}_{}",
                    self.session_id, tracker.context.task_count, item
                ),
            )
        });

        let tracking = Tracking {
            conversation_id: conversation_id.clone(),
            task_id: task.as_ref().map(|(_, id)| id.clone()),
            session_id: self.session_id.clone(),
            timestamp: entry.timestamp,
        };

        let response = respond(&tracking);
        let status = if entry.blocked {
            RecordStatus::Blocked
        } else if is_error_response(&response) {
            RecordStatus::Error
        } else {
            RecordStatus::Completed
        };

        let elapsed_ms = entry.started.elapsed().as_secs_f64() * 1000.0;
        tracker.context.performance_metrics.observe(status, elapsed_ms);

        let conversation = ConversationRecord {
            conversation_id,
            session_id: self.session_id.clone(),
            sequence: sequence as i64,
            timestamp: entry.timestamp,
            method: entry.method.clone(),
            tool_name: entry.tool_name.clone(),
            request: entry.request.clone(),
            response: response.clone(),
            task_id: tracking.task_id.clone(),
            status,
        };

        let task_record = match (task, &entry.work_item) {
            (Some((seq, task_id)), Some(item)) => {
                let now = Utc::now();
                Some(TaskRecord {
                    task_id,
                    session_id: self.session_id.clone(),
                    sequence: seq as i64,
                    created_at: entry.timestamp,
                    updated_at: now,
                    task_type: item.clone(),
                    status,
                    progress_data: json!({
                        "method": entry.method,
                        "conversation_id": tracking.conversation_id,
                        "response_time_ms": elapsed_ms,
                    }),
                })
            }
            _ => None,
        };

        if let Err(e) = self.store.record(&conversation, task_record.as_ref()).await {
            error!(
                "Audit write failed for {}: {:#}",
                tracking.conversation_id, e
            );
        }

        info!(
            "[{}] {} {} in {:.1}ms",
            tracking.conversation_id,
            entry.method,
            status.as_str(),
            elapsed_ms
        );

        let interval =
            seconds_span(self.audit.snapshot_interval_secs).unwrap_or(Duration::MAX);
        let due = tracker
            .last_snapshot
            .map_or(true, |last| Utc::now() - last > interval);
        if due {
            self.save_snapshot(&mut tracker, SnapshotKind::Periodic, Utc::now())
                .await;
        }

        response
    }

    /// Write a periodic snapshot now, regardless of the interval
    pub async fn persist(&self) {
        let mut tracker = self.tracker.lock().await;
        self.save_snapshot(&mut tracker, SnapshotKind::Periodic, Utc::now())
            .await;
    }

    async fn save_snapshot(&self, tracker: &mut Tracker, kind: SnapshotKind, at: DateTime<Utc>) {
        let payload = match serde_json::to_value(&tracker.context) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode session context: {}", e);
                return;
            }
        };
        let metadata = json!({
            "snapshot_type": kind.as_str(),
            "session_started_at": self.started_at.to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION"),
        });

        match self.store.snapshot(kind, payload, metadata, at).await {
            Ok(_) => tracker.last_snapshot = Some(at),
            Err(e) => error!("Snapshot failed: {:#}", e),
        }
    }

    /// Restore the newest snapshot younger than `max_age` into this session
    pub async fn restore_context(&self, max_age: Duration) -> Result<SessionContext, GatewayError> {
        let payload = self
            .store
            .restore(&self.session_id, max_age, Utc::now())
            .await?;
        let restored: SessionContext = serde_json::from_value(payload)
            .map_err(|e| GatewayError::Internal(format!("corrupt snapshot payload: {}", e)))?;

        let mut tracker = self.tracker.lock().await;
        tracker.merge(restored);
        Ok(tracker.context.clone())
    }

    /// Write an entry into short-term memory
    pub async fn remember(&self, key: String, value: Value) -> usize {
        let mut tracker = self.tracker.lock().await;
        tracker.context.context_memory.insert(key, value);
        tracker.context.context_memory.len()
    }

    pub async fn context(&self) -> SessionContext {
        self.tracker.lock().await.context.clone()
    }

    /// Summary used by `session_info` and `session://info`
    pub async fn info(&self) -> Value {
        let context = self.context().await;
        let now = Utc::now();
        let uptime = (now - self.started_at).num_seconds().max(0);

        let recent = match self
            .store
            .conversations()
            .count_since(&self.session_id, now - Duration::hours(1), ConversationFilter::Any)
            .await
        {
            Ok(count) => json!(count),
            Err(e) => {
                warn!("Recent activity unavailable: {:#}", e);
                Value::Null
            }
        };

        let last_snapshot = match self.store.last_snapshot_at().await {
            Ok(at) => json!(at.map(|t| t.to_rfc3339())),
            Err(e) => {
                warn!("Snapshot time unavailable: {:#}", e);
                Value::Null
            }
        };

        json!({
            "session_id": self.session_id,
            "started_at": self.started_at.to_rfc3339(),
            "uptime_secs": uptime,
            "uptime": format!("{:02}:{:02}:{:02}", uptime / 3600, (uptime % 3600) / 60, uptime % 60),
            "conversation_count": context.conversation_count,
            "task_count": context.task_count,
            "memory_entries": context.context_memory.len(),
            "recent_conversations_1h": recent,
            "last_snapshot": last_snapshot,
            "version": env!("CARGO_PKG_VERSION"),
        })
    }

    /// Aggregate statistics, optionally with in-memory performance metrics
    pub async fn statistics(&self, include_performance: bool) -> Result<Value, GatewayError> {
        let stats = self
            .store
            .statistics()
            .await
            .map_err(|e| GatewayError::StoreUnavailable(format!("{:#}", e)))?;

        let mut value = serde_json::to_value(&stats)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        if include_performance {
            let metrics = self.context().await.performance_metrics;
            value["performance"] = json!({
                "total_requests": metrics.total_requests,
                "successful_operations": metrics.successful_operations,
                "blocked_operations": metrics.blocked_operations,
                "failed_operations": metrics.failed_operations,
                "average_response_time_ms": metrics.average_response_time_ms,
                "success_rate": metrics.success_rate(),
            });
        }

        Ok(value)
    }
}
