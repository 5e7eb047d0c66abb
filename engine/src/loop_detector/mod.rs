//! Loop detection module
//!
//! Rejects bursts of identical requests before they reach a handler. The
//! detector keeps no state of its own: every check counts the session's
//! conversation records inside a sliding window using the indexed `method`
//! and `tool_name` columns, so a restart never resets or replays a verdict.
//!
//! - **Method limit**: the 20th call of one method inside 10s is runaway
//! - **Tool limit**: for `tools/call`, the 10th call of one tool inside 10s is runaway
//!
//! The request being checked counts toward the limit. Nothing already
//! recorded is revisited, so the detector is never retroactive.

use anyhow::Result;
use chrono::{DateTime, Utc};
use saan_sdk::{GatewayError, LoopScope};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::db::{seconds_span, ConversationFilter, ConversationRepository};

/// Window and limits for the detector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopLimits {
    pub window_secs: u64,
    pub method_limit: i64,
    pub tool_limit: i64,
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self {
            window_secs: 10,
            method_limit: 20,
            tool_limit: 10,
        }
    }
}

/// Outcome of a loop check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopVerdict {
    Clear,
    Runaway {
        scope: LoopScope,
        /// Calls in the window including the current one
        count: i64,
        limit: i64,
    },
}

impl LoopVerdict {
    pub fn is_runaway(&self) -> bool {
        matches!(self, LoopVerdict::Runaway { .. })
    }

    /// Build the wire error for a runaway verdict
    pub fn into_error(self, conversation_id: &str, window_secs: u64) -> Option<GatewayError> {
        match self {
            LoopVerdict::Clear => None,
            LoopVerdict::Runaway {
                scope,
                count,
                limit,
            } => Some(GatewayError::LoopDetected {
                conversation_id: conversation_id.to_string(),
                scope,
                count,
                limit,
                window_secs,
            }),
        }
    }
}

/// Store-backed loop detector
#[derive(Clone)]
pub struct LoopDetector {
    conversations: ConversationRepository,
    limits: LoopLimits,
}

impl LoopDetector {
    pub fn new(conversations: ConversationRepository, limits: LoopLimits) -> Self {
        Self {
            conversations,
            limits,
        }
    }

    pub fn limits(&self) -> &LoopLimits {
        &self.limits
    }

    /// Check a request, failing open when the store cannot be read
    pub async fn check(
        &self,
        session_id: &str,
        method: &str,
        params: &Value,
        now: DateTime<Utc>,
    ) -> LoopVerdict {
        match self.inspect(session_id, method, params, now).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!("Loop check skipped, audit store unreadable: {:#}", e);
                LoopVerdict::Clear
            }
        }
    }

    pub async fn is_runaway(
        &self,
        session_id: &str,
        method: &str,
        params: &Value,
        now: DateTime<Utc>,
    ) -> bool {
        self.check(session_id, method, params, now)
            .await
            .is_runaway()
    }

    /// Count the window and decide; store errors propagate
    pub async fn inspect(
        &self,
        session_id: &str,
        method: &str,
        params: &Value,
        now: DateTime<Utc>,
    ) -> Result<LoopVerdict> {
        let since = seconds_span(self.limits.window_secs)
            .and_then(|window| now.checked_sub_signed(window))
            .ok_or_else(|| {
                anyhow::anyhow!("window of {}s is out of range", self.limits.window_secs)
            })?;

        let method_count = self
            .conversations
            .count_since(session_id, since, ConversationFilter::Method(method))
            .await?
            + 1;
        debug!(
            "Loop check {}: {}/{} in {}s",
            method, method_count, self.limits.method_limit, self.limits.window_secs
        );

        if method_count >= self.limits.method_limit {
            warn!(
                "Runaway pattern for method {}: {}/{}",
                method, method_count, self.limits.method_limit
            );
            return Ok(LoopVerdict::Runaway {
                scope: LoopScope::Method(method.to_string()),
                count: method_count,
                limit: self.limits.method_limit,
            });
        }

        if method == "tools/call" {
            if let Some(tool) = params.get("name").and_then(|v| v.as_str()) {
                let tool_count = self
                    .conversations
                    .count_since(session_id, since, ConversationFilter::Tool(tool))
                    .await?
                    + 1;
                debug!(
                    "Loop check tool {}: {}/{}",
                    tool, tool_count, self.limits.tool_limit
                );

                if tool_count >= self.limits.tool_limit {
                    warn!(
                        "Runaway pattern for tool {}: {}/{}",
                        tool, tool_count, self.limits.tool_limit
                    );
                    return Ok(LoopVerdict::Runaway {
                        scope: LoopScope::Tool(tool.to_string()),
                        count: tool_count,
                        limit: self.limits.tool_limit,
                    });
                }
            }
        }

        Ok(LoopVerdict::Clear)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ConversationRecord, Database, RecordStatus};
    use chrono::Duration;
    use serde_json::json;
    use tempfile::TempDir;

    async fn seed(db: &Database, n: i64, method: &str, tool: Option<&str>, at: DateTime<Utc>) {
        let repo = db.conversations();
        let base = repo.max_sequence("S").await.unwrap();
        for i in 1..=n {
            repo.insert(&ConversationRecord {
                conversation_id: format!("S_CONV_{:06}", base + i),
                session_id: "S".into(),
                sequence: base + i,
                timestamp: at,
                method: method.into(),
                tool_name: tool.map(String::from),
                request: json!({}),
                response: json!({}),
                task_id: None,
                status: RecordStatus::Completed,
            })
            .await
            .unwrap();
        }
    }

    async fn setup() -> (TempDir, Database, LoopDetector) {
        let dir = TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("audit.db")).await.unwrap();
        let detector = LoopDetector::new(db.conversations(), LoopLimits::default());
        (dir, db, detector)
    }

    #[tokio::test]
    async fn test_twentieth_method_call_is_runaway() {
        let (_dir, db, detector) = setup().await;
        let now = Utc::now();

        seed(&db, 18, "tools/list", None, now - Duration::seconds(1)).await;
        assert!(!detector.is_runaway("S", "tools/list", &json!({}), now).await);

        seed(&db, 1, "tools/list", None, now - Duration::seconds(1)).await;
        match detector.check("S", "tools/list", &json!({}), now).await {
            LoopVerdict::Runaway { scope, count, limit } => {
                assert_eq!(scope, LoopScope::Method("tools/list".into()));
                assert_eq!(count, 20);
                assert_eq!(limit, 20);
            }
            LoopVerdict::Clear => panic!("expected runaway"),
        }
    }

    #[tokio::test]
    async fn test_tenth_tool_call_is_runaway() {
        let (_dir, db, detector) = setup().await;
        let now = Utc::now();
        seed(&db, 9, "tools/call", Some("session_info"), now).await;

        let params = json!({"name": "session_info"});
        let verdict = detector.check("S", "tools/call", &params, now).await;
        assert_eq!(
            verdict,
            LoopVerdict::Runaway {
                scope: LoopScope::Tool("session_info".into()),
                count: 10,
                limit: 10,
            }
        );

        // A different tool is unaffected
        let other = json!({"name": "agent_status"});
        assert!(!detector.is_runaway("S", "tools/call", &other, now).await);
    }

    #[tokio::test]
    async fn test_window_expiry_clears() {
        let (_dir, db, detector) = setup().await;
        let now = Utc::now();
        seed(&db, 30, "tools/list", None, now - Duration::seconds(11)).await;

        assert!(!detector.is_runaway("S", "tools/list", &json!({}), now).await);
    }

    #[tokio::test]
    async fn test_other_sessions_do_not_count() {
        let (_dir, db, detector) = setup().await;
        let now = Utc::now();
        seed(&db, 30, "tools/list", None, now).await;

        assert!(!detector.is_runaway("T", "tools/list", &json!({}), now).await);
    }

    #[tokio::test]
    async fn test_fails_open_when_store_closed() {
        let (_dir, db, detector) = setup().await;
        db.close().await.unwrap();

        let now = Utc::now();
        assert!(detector.inspect("S", "tools/list", &json!({}), now).await.is_err());
        assert_eq!(
            detector.check("S", "tools/list", &json!({}), now).await,
            LoopVerdict::Clear
        );
    }

    #[test]
    fn test_verdict_into_error() {
        let verdict = LoopVerdict::Runaway {
            scope: LoopScope::Method("tools/list".into()),
            count: 20,
            limit: 20,
        };
        let err = verdict.into_error("S_CONV_000020", 10).unwrap();
        assert!(matches!(err, GatewayError::LoopDetected { count: 20, .. }));
        assert!(LoopVerdict::Clear.into_error("x", 10).is_none());
    }
}
