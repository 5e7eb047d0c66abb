//! Conductor Types
//!
//! Closed enums for the agent roster and the workflow state machine, plus
//! the records persisted in the ledger documents.

use chrono::{DateTime, Utc};
use saan_sdk::{AgentOutput, AgentTask, GatewayError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Roster member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentId {
    Boosaan,
    Uijeongboo,
    Oolsaan,
    Ilsaan,
}

impl AgentId {
    pub const ALL: [AgentId; 4] = [
        AgentId::Boosaan,
        AgentId::Uijeongboo,
        AgentId::Oolsaan,
        AgentId::Ilsaan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentId::Boosaan => "boosaan",
            AgentId::Uijeongboo => "uijeongboo",
            AgentId::Oolsaan => "oolsaan",
            AgentId::Ilsaan => "ilsaan",
        }
    }

    pub fn role(&self) -> AgentRole {
        match self {
            AgentId::Boosaan => AgentRole::ContextManager,
            AgentId::Uijeongboo => AgentRole::InterfaceManager,
            AgentId::Oolsaan => AgentRole::QualityAssurance,
            AgentId::Ilsaan => AgentRole::WorkflowManager,
        }
    }

    pub fn capabilities(&self) -> &'static [&'static str] {
        match self {
            AgentId::Boosaan => &[
                "context_persistence",
                "session_isolation",
                "priority_filtering",
            ],
            AgentId::Uijeongboo => &["ui_automation", "ux_optimization", "interface_design"],
            AgentId::Oolsaan => &[
                "code_validation",
                "automated_testing",
                "performance_analysis",
            ],
            AgentId::Ilsaan => &[
                "task_sequencing",
                "auto_recovery",
                "deployment_automation",
            ],
        }
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentId {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentId::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| GatewayError::InvalidParams(format!("unknown agent: {}", s)))
    }
}

/// What an agent is responsible for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    ContextManager,
    InterfaceManager,
    QualityAssurance,
    WorkflowManager,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::ContextManager => "context_manager",
            AgentRole::InterfaceManager => "interface_manager",
            AgentRole::QualityAssurance => "quality_assurance",
            AgentRole::WorkflowManager => "workflow_manager",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Standby,
    Working,
}

/// Registry entry for one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub role: AgentRole,
    pub status: AgentStatus,
    pub capabilities: Vec<String>,
    pub current_task: Option<AgentTask>,
}

impl AgentRecord {
    /// Fresh standby record from the roster table
    pub fn standby(id: AgentId) -> Self {
        Self {
            id,
            role: id.role(),
            status: AgentStatus::Standby,
            capabilities: id.capabilities().iter().map(|c| c.to_string()).collect(),
            current_task: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Initializing,
    Running,
    Completed,
}

/// A workflow that has been registered but not yet completed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub workflow_id: String,
    #[serde(rename = "type")]
    pub template: String,
    pub started_at: DateTime<Utc>,
    pub context: Map<String, Value>,
    pub current_step: Option<String>,
    /// Position of `current_step` in the chain
    #[serde(default)]
    pub step_index: Option<usize>,
    pub total_steps: usize,
    pub status: WorkflowStatus,
}

impl WorkflowInstance {
    /// `(index + 1) / total`, or 0.0 before the first step
    pub fn progress(&self) -> f64 {
        step_progress(self.step_index, self.total_steps)
    }
}

pub(crate) fn step_progress(step_index: Option<usize>, total_steps: usize) -> f64 {
    match step_index {
        Some(idx) if total_steps > 0 => (idx + 1) as f64 / total_steps as f64,
        _ => 0.0,
    }
}

/// How a workflow ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WorkflowOutcome {
    Succeeded,
    Failed { step_id: String, reason: String },
    TimedOut { step_id: String, limit_ms: u64 },
}

impl WorkflowOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, WorkflowOutcome::Succeeded)
    }
}

/// Completed-ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedWorkflow {
    pub workflow_id: String,
    #[serde(rename = "type")]
    pub template: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub context: Map<String, Value>,
    pub steps_completed: Vec<String>,
    pub outcome: WorkflowOutcome,
    /// Progress of the last step reached
    pub progress: f64,
    pub status: WorkflowStatus,
}

/// Escalation policy stored alongside the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationRules {
    pub max_step_duration_secs: u64,
    pub auto_recovery: bool,
}

impl Default for EscalationRules {
    fn default() -> Self {
        Self {
            max_step_duration_secs: 3600,
            auto_recovery: true,
        }
    }
}

/// Output of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub step_id: String,
    pub agent: AgentId,
    pub output: AgentOutput,
}

/// Result of driving a workflow to completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub workflow: CompletedWorkflow,
    pub outputs: Vec<StepOutput>,
}

impl WorkflowReport {
    pub fn succeeded(&self) -> bool {
        self.workflow.outcome.is_success()
    }

    /// Turn a failed outcome into the matching error
    pub fn into_result(self) -> Result<Self, GatewayError> {
        match &self.workflow.outcome {
            WorkflowOutcome::Succeeded => Ok(self),
            WorkflowOutcome::Failed { step_id, reason } => Err(GatewayError::AgentFailure {
                workflow_id: self.workflow.workflow_id.clone(),
                step_id: step_id.clone(),
                reason: reason.clone(),
            }),
            WorkflowOutcome::TimedOut { step_id, limit_ms } => Err(GatewayError::StepTimeout {
                workflow_id: self.workflow.workflow_id.clone(),
                step_id: step_id.clone(),
                limit_ms: *limit_ms,
            }),
        }
    }
}
