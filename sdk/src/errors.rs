//! Error types and handling
//!
//! This module provides the error taxonomy used throughout the SAAN gateway.
//! All errors implement the `GatewayErrorExt` trait which maps them onto the
//! wire error codes, gives a caller-facing hint, and says whether a caller may
//! retry the same request.
//!
//! # Wire codes
//!
//! | code   | meaning                                  |
//! |--------|------------------------------------------|
//! | -32000 | risk threshold exceeded                  |
//! | -32001 | loop/abuse detected                      |
//! | -32601 | unknown method or tool                   |
//! | -32602 | invalid params or unknown resource       |
//! | -32603 | internal error (store, agent, workflow)  |

use crate::types::{RiskAssessment, RpcError};
use serde_json::json;
use thiserror::Error;

/// Risk threshold exceeded
pub const CODE_RISK_REJECTED: i64 = -32000;
/// Loop/abuse detected
pub const CODE_LOOP_DETECTED: i64 = -32001;
/// Unparseable input line
pub const CODE_PARSE_ERROR: i64 = -32700;
/// Unknown method or tool
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
/// Invalid parameters
pub const CODE_INVALID_PARAMS: i64 = -32602;
/// Internal error
pub const CODE_INTERNAL: i64 = -32603;

/// Trait for gateway error extensions
pub trait GatewayErrorExt {
    /// Wire error code
    fn code(&self) -> i64;

    /// Returns a user-friendly hint for the error
    fn user_hint(&self) -> &str;

    /// Returns whether repeating the same request may succeed
    ///
    /// Loop rejections are deliberately not retryable: the caller must back off.
    fn is_retryable(&self) -> bool;
}

/// Which counter tripped the loop detector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopScope {
    /// Same method within the window
    Method(String),
    /// Same tool name within `tools/call` requests
    Tool(String),
}

impl std::fmt::Display for LoopScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopScope::Method(m) => write!(f, "method '{}'", m),
            LoopScope::Tool(t) => write!(f, "tool '{}'", t),
        }
    }
}

/// Main gateway error type
#[derive(Debug, Error)]
pub enum GatewayError {
    // Gate errors
    #[error("Risk threshold exceeded - request blocked [conversation: {conversation_id}]")]
    RiskRejected {
        conversation_id: String,
        assessment: RiskAssessment,
    },

    #[error("Loop protection - {scope} called {count} times within {window_secs}s (limit {limit}) [conversation: {conversation_id}]")]
    LoopDetected {
        conversation_id: String,
        scope: LoopScope,
        count: i64,
        limit: i64,
        window_secs: u64,
    },

    // Caller errors
    #[error("Method not found: {0}")]
    UnknownMethod(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    // Workflow errors
    #[error("Workflow template not found: {0}")]
    TemplateNotFound(String),

    #[error("Invalid workflow template '{template}': {reason}")]
    TemplateInvalid { template: String, reason: String },

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Agent failure in workflow {workflow_id} at step {step_id}: {reason}")]
    AgentFailure {
        workflow_id: String,
        step_id: String,
        reason: String,
    },

    #[error("Step {step_id} of workflow {workflow_id} exceeded {limit_ms}ms")]
    StepTimeout {
        workflow_id: String,
        step_id: String,
        limit_ms: u64,
    },

    // Store errors
    #[error("Audit store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("No context snapshot for session {session_id} within {max_age_secs}s")]
    SnapshotNotFound {
        session_id: String,
        max_age_secs: u64,
    },

    #[error("Snapshot schema version {found} is incompatible (expected {expected})")]
    SnapshotVersionMismatch { found: u32, expected: u32 },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Convert into the wire error object
    ///
    /// Risk rejections carry the full per-dimension breakdown in `data`.
    pub fn to_rpc_error(&self) -> RpcError {
        let err = RpcError::new(self.code(), self.to_string());
        match self {
            GatewayError::RiskRejected { assessment, .. } => {
                err.with_data(json!(assessment))
            }
            GatewayError::LoopDetected {
                scope,
                count,
                limit,
                window_secs,
                ..
            } => err.with_data(json!({
                "scope": scope.to_string(),
                "count": count,
                "limit": limit,
                "window_secs": window_secs,
            })),
            _ => err,
        }
    }
}

impl GatewayErrorExt for GatewayError {
    fn code(&self) -> i64 {
        match self {
            Self::RiskRejected { .. } => CODE_RISK_REJECTED,
            Self::LoopDetected { .. } => CODE_LOOP_DETECTED,
            Self::UnknownMethod(_) | Self::UnknownTool(_) => CODE_METHOD_NOT_FOUND,
            Self::UnknownResource(_)
            | Self::InvalidParams(_)
            | Self::TemplateNotFound(_)
            | Self::TemplateInvalid { .. }
            | Self::WorkflowNotFound(_) => CODE_INVALID_PARAMS,
            _ => CODE_INTERNAL,
        }
    }

    fn user_hint(&self) -> &str {
        match self {
            Self::RiskRejected { .. } => "Request judged too risky. Narrow the operation",
            Self::LoopDetected { .. } => "Too many identical requests. Back off and try later",
            Self::UnknownMethod(_) => "Unsupported method",
            Self::UnknownTool(_) => "The requested tool is not available",
            Self::UnknownResource(_) => "The requested resource does not exist",
            Self::InvalidParams(_) => "Check the request arguments",
            Self::TemplateNotFound(_) => "Use one of the templates listed by list_workflows",
            Self::TemplateInvalid { .. } => "Template steps must form a single chain",
            Self::WorkflowNotFound(_) => "Unknown workflow id",
            Self::AgentFailure { .. } => "An agent failed; the workflow was stopped",
            Self::StepTimeout { .. } => "A workflow step took too long and was stopped",
            Self::StoreUnavailable(_) => "Audit store unavailable. Requests are still served",
            Self::SnapshotNotFound { .. } => "No recent context to restore. Try a wider window",
            Self::SnapshotVersionMismatch { .. } => "Stored context is from an incompatible version",
            Self::Config(_) => "Check your config.toml file for errors",
            Self::Internal(_) => "Internal error",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            // Caller must change something before retrying
            Self::RiskRejected { .. }
            | Self::LoopDetected { .. }
            | Self::UnknownMethod(_)
            | Self::UnknownTool(_)
            | Self::UnknownResource(_)
            | Self::InvalidParams(_)
            | Self::TemplateNotFound(_)
            | Self::TemplateInvalid { .. }
            | Self::WorkflowNotFound(_)
            | Self::SnapshotVersionMismatch { .. }
            | Self::Config(_) => false,

            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RiskLevel, RiskScores};

    fn assessment() -> RiskAssessment {
        RiskAssessment::from_scores(RiskScores {
            security: 8,
            functional: 7,
            contextual: 15,
            performance: 4,
            operational: 2,
        })
    }

    #[test]
    fn test_codes_distinguish_risk_and_loop() {
        let risk = GatewayError::RiskRejected {
            conversation_id: "S_CONV_000001".into(),
            assessment: assessment(),
        };
        let looped = GatewayError::LoopDetected {
            conversation_id: "S_CONV_000002".into(),
            scope: LoopScope::Method("tools/list".into()),
            count: 20,
            limit: 20,
            window_secs: 10,
        };
        assert_eq!(risk.code(), -32000);
        assert_eq!(looped.code(), -32001);
        assert!(!looped.is_retryable());
    }

    #[test]
    fn test_risk_rejection_carries_breakdown() {
        let err = GatewayError::RiskRejected {
            conversation_id: "S_CONV_000001".into(),
            assessment: assessment(),
        };
        let rpc = err.to_rpc_error();
        let data = rpc.data.unwrap();
        assert_eq!(data["total"], 36);
        assert_eq!(data["level"], "CRITICAL");
        assert_eq!(data["scores"]["contextual"], 15);
        assert!(rpc.message.contains("S_CONV_000001"));
        assert_eq!(assessment().level, RiskLevel::Critical);
    }

    #[test]
    fn test_store_errors_are_internal_and_retryable() {
        let err = GatewayError::StoreUnavailable("disk full".into());
        assert_eq!(err.code(), CODE_INTERNAL);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_unknown_tool_is_method_not_found() {
        assert_eq!(GatewayError::UnknownTool("x".into()).code(), -32601);
        assert_eq!(GatewayError::UnknownMethod("x".into()).code(), -32601);
    }
}
