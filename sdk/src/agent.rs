//! Agent contract
//!
//! Agents are external capabilities (code analysis, meta-cognition, sandboxed
//! execution, context storage). The gateway never looks inside them: it hands
//! an agent an `AgentTask` and receives either an `AgentOutput` or an
//! `AgentError`. Everything else about an agent is opaque.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Task descriptor attached to an agent while it works on a workflow step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub workflow_id: String,
    pub step_id: String,
    /// Caller-supplied payload, opaque to the orchestrator
    pub context: Map<String, Value>,
    pub assigned_at: DateTime<Utc>,
}

/// Successful result of an agent's work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub summary: String,
    #[serde(default)]
    pub data: Value,
}

impl AgentOutput {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            data: Value::Null,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Failure reported by an agent
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AgentError {
    /// The agent ran and reported failure
    #[error("agent reported failure: {0}")]
    Failed(String),

    /// The agent could not be reached or refused the task
    #[error("agent unavailable: {0}")]
    Unavailable(String),

    /// The request never reached the agent (gated or unauditable)
    #[error("step rejected: {0}")]
    Rejected(String),

    /// The agent did not answer within the step limit
    #[error("agent did not finish within {limit_ms}ms")]
    TimedOut { limit_ms: u64 },
}

/// Trait that every agent implementation satisfies
#[async_trait]
pub trait Agent: Send + Sync {
    /// Roster id the agent answers to
    fn name(&self) -> &str;

    /// Perform the work described by `task`
    async fn perform(&self, task: &AgentTask) -> Result<AgentOutput, AgentError>;
}
