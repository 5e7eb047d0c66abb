//! Conductor System
//!
//! Drives template-based workflows across the agent roster. The
//! `Orchestrator` owns the roster and the workflow ledger; agents are reached
//! through a `StepDispatcher` and progress is checkpointed through a
//! `CheckpointStore`, so the conductor itself does no auditing or gating.

pub mod ledger;
pub mod orchestrator;
pub mod template;
pub mod types;

use async_trait::async_trait;
use saan_sdk::{AgentError, AgentOutput, AgentTask};
use serde_json::Value;
use std::time::Duration;

pub use ledger::{AgentRegistryDoc, Ledger, LedgerLock, TaskContinuumDoc};
pub use orchestrator::{Orchestrator, WorkflowHandle};
pub use template::{default_templates, Step, WorkflowTemplate};
pub use types::{
    AgentId, AgentRecord, AgentRole, AgentStatus, CompletedWorkflow, EscalationRules, StepOutput,
    WorkflowInstance, WorkflowOutcome, WorkflowReport, WorkflowStatus,
};

/// Hands a step's task to the agent bound to it
///
/// The dispatcher owns the step deadline: an agent still working after
/// `limit` is abandoned and reported as `AgentError::TimedOut`.
#[async_trait]
pub trait StepDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        agent: AgentId,
        task: &AgentTask,
        limit: Duration,
    ) -> Result<AgentOutput, AgentError>;
}

/// Durable sink for workflow checkpoints
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Record `state` for a workflow at a step boundary
    async fn checkpoint(&self, workflow_id: &str, state: Value, metadata: Value)
        -> anyhow::Result<()>;
}
