//! Workflow Orchestrator
//!
//! State machine per instance: `initializing → running → completed`. A step
//! failure or a step overrunning `max_step_duration` completes the instance
//! with a failure record; there is no retry.
//!
//! Each agent is held by at most one step at a time. Instances that share an
//! agent interleave on its slot, everything else runs concurrently.

use anyhow::Result;
use chrono::Utc;
use saan_sdk::{AgentError, AgentTask, GatewayError};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::ledger::{AgentRegistryDoc, Ledger, LedgerLock, TaskContinuumDoc};
use super::template::{default_templates, Step, WorkflowTemplate};
use super::types::{
    step_progress, AgentId, AgentRecord, AgentStatus, CompletedWorkflow, EscalationRules,
    StepOutput, WorkflowInstance, WorkflowOutcome, WorkflowReport, WorkflowStatus,
};
use super::{CheckpointStore, StepDispatcher};

/// A registered workflow waiting to be driven by [`Orchestrator::run`]
#[derive(Debug, Clone)]
pub struct WorkflowHandle {
    workflow_id: String,
    template: WorkflowTemplate,
    context: Map<String, Value>,
}

impl WorkflowHandle {
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn template(&self) -> &WorkflowTemplate {
        &self.template
    }
}

struct LedgerState {
    registry: AgentRegistryDoc,
    continuum: TaskContinuumDoc,
}

pub struct Orchestrator {
    ledger: Ledger,
    _lock: LedgerLock,
    dispatcher: Arc<dyn StepDispatcher>,
    checkpoints: Arc<dyn CheckpointStore>,
    state: Mutex<LedgerState>,
    slots: BTreeMap<AgentId, Arc<Mutex<()>>>,
    sequence: AtomicU64,
    step_limit_override: Option<Duration>,
}

impl Orchestrator {
    /// Lock and load the ledger, recover interrupted work and persist the result
    ///
    /// Recovery is safe because the lock guarantees no other live process
    /// is still driving the instances it finds.
    pub async fn open(
        ledger: Ledger,
        dispatcher: Arc<dyn StepDispatcher>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Result<Self> {
        let lock = ledger.lock()?;

        let mut registry = ledger
            .load_registry()
            .await?
            .unwrap_or_else(AgentRegistryDoc::fresh);
        normalize_registry(&mut registry);

        let mut continuum = ledger
            .load_continuum()
            .await?
            .unwrap_or_else(TaskContinuumDoc::fresh);
        if continuum.workflow_templates.is_empty() {
            continuum.workflow_templates = default_templates();
        }

        if continuum.escalation_rules.auto_recovery {
            recover(&mut registry, &mut continuum);
        } else if !continuum.active_workflows.is_empty() {
            warn!(
                "{} workflows left active and auto recovery is off",
                continuum.active_workflows.len()
            );
        }

        ledger.save_registry(&registry).await?;
        ledger.save_continuum(&continuum).await?;

        let seed = (continuum.active_workflows.len() + continuum.completed_workflows.len()) as u64;
        info!(
            "Orchestrator ready: {} agents, {} templates, {} completed workflows",
            registry.agents.len(),
            continuum.workflow_templates.len(),
            continuum.completed_workflows.len()
        );

        Ok(Self {
            ledger,
            _lock: lock,
            dispatcher,
            checkpoints,
            state: Mutex::new(LedgerState {
                registry,
                continuum,
            }),
            slots: AgentId::ALL
                .into_iter()
                .map(|id| (id, Arc::new(Mutex::new(()))))
                .collect(),
            sequence: AtomicU64::new(seed),
            step_limit_override: None,
        })
    }

    /// Override the ledger's `max_step_duration_secs`
    pub fn with_max_step_duration(mut self, limit: Duration) -> Self {
        self.step_limit_override = Some(limit);
        self
    }

    /// Validate, register and checkpoint a new instance
    ///
    /// An unknown template fails before anything is mutated.
    pub async fn begin(
        &self,
        template: &str,
        context: Map<String, Value>,
    ) -> Result<WorkflowHandle, GatewayError> {
        let mut state = self.state.lock().await;

        let template = state
            .continuum
            .workflow_templates
            .get(template)
            .cloned()
            .ok_or_else(|| GatewayError::TemplateNotFound(template.to_string()))?;

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        let workflow_id = format!(
            "workflow_{}_{:04}_{}",
            now.format("%Y%m%d_%H%M%S"),
            seq,
            template.name()
        );

        let instance = WorkflowInstance {
            workflow_id: workflow_id.clone(),
            template: template.name().to_string(),
            started_at: now,
            context: context.clone(),
            current_step: None,
            step_index: None,
            total_steps: template.len(),
            status: WorkflowStatus::Initializing,
        };

        state
            .continuum
            .active_workflows
            .insert(workflow_id.clone(), instance.clone());
        state.continuum.last_updated = now;

        if let Err(e) = self.ledger.save_continuum(&state.continuum).await {
            state.continuum.active_workflows.remove(&workflow_id);
            error!("Failed to register workflow {}: {:#}", workflow_id, e);
            return Err(GatewayError::Internal(format!(
                "failed to register workflow: {:#}",
                e
            )));
        }
        drop(state);

        info!("Workflow {} registered ({} steps)", workflow_id, template.len());
        self.checkpoint_instance(&instance, "workflow_started").await;

        Ok(WorkflowHandle {
            workflow_id,
            template,
            context,
        })
    }

    /// Drive a registered instance through its step chain
    pub async fn run(&self, handle: WorkflowHandle) -> WorkflowReport {
        let WorkflowHandle {
            workflow_id,
            template,
            context,
        } = handle;

        let limit = self.max_step_duration().await;
        let mut steps_completed = Vec::new();
        let mut outputs = Vec::new();
        let mut outcome = WorkflowOutcome::Succeeded;
        let mut reached = None;

        for (idx, step) in template.steps().iter().enumerate() {
            let slot = self.slots.get(&step.agent).cloned().unwrap_or_default();
            let _held = slot.lock().await;

            let task = AgentTask {
                workflow_id: workflow_id.clone(),
                step_id: step.id.clone(),
                context: context.clone(),
                assigned_at: Utc::now(),
            };

            if let Some(instance) = self.assign(&workflow_id, idx, step, &task).await {
                self.checkpoint_instance(&instance, "step_started").await;
            }
            reached = Some(idx);

            debug!("Workflow {} step {} -> {}", workflow_id, step.id, step.agent);
            let result = self.dispatcher.dispatch(step.agent, &task, limit).await;
            self.release(step.agent).await;

            match result {
                Ok(output) => {
                    info!(
                        "Workflow {} step {} done by {}",
                        workflow_id, step.id, step.agent
                    );
                    steps_completed.push(step.id.clone());
                    outputs.push(StepOutput {
                        step_id: step.id.clone(),
                        agent: step.agent,
                        output,
                    });
                }
                Err(AgentError::TimedOut { limit_ms }) => {
                    warn!(
                        "Workflow {} step {} exceeded {}ms",
                        workflow_id, step.id, limit_ms
                    );
                    outcome = WorkflowOutcome::TimedOut {
                        step_id: step.id.clone(),
                        limit_ms,
                    };
                    break;
                }
                Err(e) => {
                    warn!("Workflow {} failed at {}: {}", workflow_id, step.id, e);
                    outcome = WorkflowOutcome::Failed {
                        step_id: step.id.clone(),
                        reason: e.to_string(),
                    };
                    break;
                }
            }
        }

        let workflow = self
            .complete(
                &workflow_id,
                &template,
                context,
                steps_completed,
                outcome,
                step_progress(reached, template.len()),
            )
            .await;

        WorkflowReport { workflow, outputs }
    }

    /// `begin` followed by `run`
    pub async fn start(
        &self,
        template: &str,
        context: Map<String, Value>,
    ) -> Result<WorkflowReport, GatewayError> {
        let handle = self.begin(template, context).await?;
        Ok(self.run(handle).await)
    }

    /// Fraction of the chain reached by an instance
    pub async fn progress(&self, workflow_id: &str) -> Result<f64, GatewayError> {
        let state = self.state.lock().await;

        if let Some(instance) = state.continuum.active_workflows.get(workflow_id) {
            return Ok(instance.progress());
        }
        if let Some(done) = state.continuum.completed_workflows.get(workflow_id) {
            return Ok(done.progress);
        }
        Err(GatewayError::WorkflowNotFound(workflow_id.to_string()))
    }

    pub async fn active_workflows(&self) -> Vec<WorkflowInstance> {
        let state = self.state.lock().await;
        state.continuum.active_workflows.values().cloned().collect()
    }

    pub async fn completed_workflows(&self) -> Vec<CompletedWorkflow> {
        let state = self.state.lock().await;
        state.continuum.completed_workflows.values().cloned().collect()
    }

    pub async fn completed_workflow(&self, workflow_id: &str) -> Option<CompletedWorkflow> {
        let state = self.state.lock().await;
        state.continuum.completed_workflows.get(workflow_id).cloned()
    }

    pub async fn agents(&self) -> Vec<AgentRecord> {
        self.state.lock().await.registry.agents.clone()
    }

    pub async fn agent(&self, id: AgentId) -> Option<AgentRecord> {
        let state = self.state.lock().await;
        state.registry.agents.iter().find(|a| a.id == id).cloned()
    }

    pub async fn templates(&self) -> Vec<WorkflowTemplate> {
        let state = self.state.lock().await;
        state.continuum.workflow_templates.values().cloned().collect()
    }

    pub async fn escalation_rules(&self) -> EscalationRules {
        self.state.lock().await.continuum.escalation_rules.clone()
    }

    async fn max_step_duration(&self) -> Duration {
        match self.step_limit_override {
            Some(limit) => limit,
            None => Duration::from_secs(self.escalation_rules().await.max_step_duration_secs),
        }
    }

    /// Mark the agent working and move the instance onto `step`
    async fn assign(
        &self,
        workflow_id: &str,
        idx: usize,
        step: &Step,
        task: &AgentTask,
    ) -> Option<WorkflowInstance> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        if let Some(agent) = state.registry.agents.iter_mut().find(|a| a.id == step.agent) {
            agent.status = AgentStatus::Working;
            agent.current_task = Some(task.clone());
        }
        state.registry.last_updated = now;

        let instance = state
            .continuum
            .active_workflows
            .get_mut(workflow_id)
            .map(|instance| {
                instance.status = WorkflowStatus::Running;
                instance.current_step = Some(step.id.clone());
                instance.step_index = Some(idx);
                instance.clone()
            });
        state.continuum.last_updated = now;

        if let Err(e) = self.ledger.save_registry(&state.registry).await {
            error!("Failed to save agent registry: {:#}", e);
        }
        if let Err(e) = self.ledger.save_continuum(&state.continuum).await {
            error!("Failed to save workflow ledger: {:#}", e);
        }

        instance
    }

    async fn release(&self, agent: AgentId) {
        let mut state = self.state.lock().await;

        if let Some(record) = state.registry.agents.iter_mut().find(|a| a.id == agent) {
            record.status = AgentStatus::Standby;
            record.current_task = None;
        }
        state.registry.last_updated = Utc::now();

        if let Err(e) = self.ledger.save_registry(&state.registry).await {
            error!("Failed to save agent registry: {:#}", e);
        }
    }

    /// Move an instance from the active to the completed ledger
    async fn complete(
        &self,
        workflow_id: &str,
        template: &WorkflowTemplate,
        context: Map<String, Value>,
        steps_completed: Vec<String>,
        outcome: WorkflowOutcome,
        progress: f64,
    ) -> CompletedWorkflow {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let started_at = state
            .continuum
            .active_workflows
            .remove(workflow_id)
            .map(|instance| instance.started_at)
            .unwrap_or(now);

        let record = CompletedWorkflow {
            workflow_id: workflow_id.to_string(),
            template: template.name().to_string(),
            started_at,
            completed_at: now,
            context,
            steps_completed,
            outcome,
            progress,
            status: WorkflowStatus::Completed,
        };

        state
            .continuum
            .completed_workflows
            .insert(workflow_id.to_string(), record.clone());
        state.continuum.last_updated = now;

        if let Err(e) = self.ledger.save_continuum(&state.continuum).await {
            error!("Failed to save workflow ledger: {:#}", e);
        }
        drop(state);

        let event = if record.outcome.is_success() {
            "workflow_completed"
        } else {
            "workflow_failed"
        };
        info!(
            "Workflow {} {} after {} steps",
            workflow_id,
            event,
            record.steps_completed.len()
        );

        let metadata = json!({
            "event": event,
            "status": record.status,
            "progress": record.progress,
        });
        self.checkpoint(
            workflow_id,
            serde_json::to_value(&record).unwrap_or_default(),
            metadata,
        )
        .await;

        record
    }

    async fn checkpoint_instance(&self, instance: &WorkflowInstance, event: &str) {
        let metadata = json!({
            "event": event,
            "step_id": instance.current_step,
            "status": instance.status,
            "progress": instance.progress(),
        });
        self.checkpoint(
            &instance.workflow_id,
            serde_json::to_value(instance).unwrap_or_default(),
            metadata,
        )
        .await;
    }

    async fn checkpoint(&self, workflow_id: &str, state: Value, metadata: Value) {
        if let Err(e) = self
            .checkpoints
            .checkpoint(workflow_id, state, metadata)
            .await
        {
            error!("Checkpoint for {} failed: {:#}", workflow_id, e);
        }
    }
}

/// Keep persisted status but take role and capabilities from the roster table
fn normalize_registry(registry: &mut AgentRegistryDoc) {
    let loaded: BTreeMap<AgentId, AgentRecord> = registry
        .agents
        .drain(..)
        .map(|record| (record.id, record))
        .collect();

    registry.agents = AgentId::ALL
        .into_iter()
        .map(|id| {
            let mut record = AgentRecord::standby(id);
            if let Some(saved) = loaded.get(&id) {
                record.status = saved.status;
                record.current_task = saved.current_task.clone();
            }
            record
        })
        .collect();
}

/// Fail instances orphaned by a previous process and free their agents
fn recover(registry: &mut AgentRegistryDoc, continuum: &mut TaskContinuumDoc) {
    let now = Utc::now();
    let orphaned = std::mem::take(&mut continuum.active_workflows);

    for (workflow_id, instance) in orphaned {
        warn!("Recovering interrupted workflow {}", workflow_id);

        let steps_completed = match (
            instance.step_index,
            continuum.workflow_templates.get(&instance.template),
        ) {
            (Some(idx), Some(template)) => template
                .steps()
                .iter()
                .take(idx)
                .map(|s| s.id.clone())
                .collect(),
            _ => Vec::new(),
        };

        let progress = instance.progress();
        continuum.completed_workflows.insert(
            workflow_id.clone(),
            CompletedWorkflow {
                workflow_id,
                template: instance.template,
                started_at: instance.started_at,
                completed_at: now,
                context: instance.context,
                steps_completed,
                outcome: WorkflowOutcome::Failed {
                    step_id: instance.current_step.unwrap_or_default(),
                    reason: "interrupted".to_string(),
                },
                progress,
                status: WorkflowStatus::Completed,
            },
        );
    }

    for agent in registry.agents.iter_mut() {
        if agent.status == AgentStatus::Working {
            warn!("Resetting agent {} to standby", agent.id);
            agent.status = AgentStatus::Standby;
            agent.current_task = None;
        }
    }
}
