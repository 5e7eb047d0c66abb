//! Integration tests for the workflow orchestrator
//!
//! Runs templates end to end against a scripted dispatcher, with the real
//! audit store receiving checkpoints and the ledger written to a temp dir.

use async_trait::async_trait;
use saan_engine::conductor::{
    AgentId, AgentStatus, Ledger, Orchestrator, StepDispatcher, WorkflowOutcome,
};
use saan_engine::db::AuditStore;
use saan_sdk::{AgentError, AgentOutput, AgentTask, GatewayError};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Default)]
struct Scripted {
    calls: Mutex<Vec<(AgentId, String)>>,
    busy: Mutex<HashSet<AgentId>>,
    overlapped: AtomicBool,
    fail_at: Option<&'static str>,
    delay: Duration,
}

impl Scripted {
    fn failing_at(step: &'static str) -> Self {
        Self {
            fail_at: Some(step),
            ..Self::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn agents(&self) -> Vec<AgentId> {
        self.calls.lock().unwrap().iter().map(|(a, _)| *a).collect()
    }
}

#[async_trait]
impl StepDispatcher for Scripted {
    async fn dispatch(
        &self,
        agent: AgentId,
        task: &AgentTask,
        limit: Duration,
    ) -> Result<AgentOutput, AgentError> {
        if !self.busy.lock().unwrap().insert(agent) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        self.calls
            .lock()
            .unwrap()
            .push((agent, task.step_id.clone()));

        let overran = !self.delay.is_zero()
            && tokio::time::timeout(limit, tokio::time::sleep(self.delay))
                .await
                .is_err();
        self.busy.lock().unwrap().remove(&agent);

        if overran {
            return Err(AgentError::TimedOut {
                limit_ms: limit.as_millis() as u64,
            });
        }

        if self.fail_at == Some(task.step_id.as_str()) {
            return Err(AgentError::Failed(format!("{} broke", task.step_id)));
        }
        Ok(AgentOutput::new(format!("{} done", task.step_id)))
    }
}

struct Harness {
    dir: TempDir,
    store: Arc<AuditStore>,
}

impl Harness {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = AuditStore::open(&dir.path().join("audit").join("S.db"), "S")
            .await
            .unwrap();
        Self {
            dir,
            store: Arc::new(store),
        }
    }

    fn ledger(&self) -> Ledger {
        Ledger::in_data_dir(self.dir.path())
    }

    async fn orchestrator(&self, dispatcher: Arc<Scripted>) -> Orchestrator {
        Orchestrator::open(self.ledger(), dispatcher, self.store.clone())
            .await
            .unwrap()
    }
}

fn context() -> Map<String, Value> {
    let mut ctx = Map::new();
    ctx.insert("project_name".into(), json!("X"));
    ctx
}

#[tokio::test]
async fn test_development_cycle_end_to_end() {
    let h = Harness::new().await;
    let dispatcher = Arc::new(Scripted::default());
    let orch = h.orchestrator(dispatcher.clone()).await;

    let report = orch.start("development_cycle", context()).await.unwrap();
    let wf = &report.workflow;

    use AgentId::*;
    assert_eq!(
        dispatcher.agents(),
        vec![Boosaan, Uijeongboo, Boosaan, Oolsaan, Ilsaan]
    );
    assert_eq!(
        wf.steps_completed,
        vec![
            "requirements_analysis",
            "design_planning",
            "implementation",
            "quality_assurance",
            "deployment_preparation",
        ]
    );
    assert_eq!(wf.outcome, WorkflowOutcome::Succeeded);
    assert_eq!(wf.context["project_name"], "X");
    assert_eq!(report.outputs.len(), 5);
    assert!((wf.progress - 1.0).abs() < 1e-9);

    // Active -> completed exactly once
    assert!(orch.active_workflows().await.is_empty());
    let completed = orch.completed_workflows().await;
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].workflow_id, wf.workflow_id);

    // Every agent back on standby
    for agent in orch.agents().await {
        assert_eq!(agent.status, AgentStatus::Standby);
        assert!(agent.current_task.is_none());
    }

    // The persisted ledger agrees
    let doc = h.ledger().load_continuum().await.unwrap().unwrap();
    assert!(doc.active_workflows.is_empty());
    assert!(doc.completed_workflows.contains_key(&wf.workflow_id));
}

#[tokio::test]
async fn test_checkpoints_track_progress() {
    let h = Harness::new().await;
    let orch = h.orchestrator(Arc::new(Scripted::default())).await;

    let report = orch.start("development_cycle", context()).await.unwrap();
    let checkpoints = h.store.checkpoints(&report.workflow.workflow_id).await.unwrap();

    let progress: Vec<f64> = checkpoints
        .iter()
        .map(|c| c.metadata["progress"].as_f64().unwrap())
        .collect();
    let expected = [0.0, 0.2, 0.4, 0.6, 0.8, 1.0, 1.0];
    assert_eq!(progress.len(), expected.len());
    for (got, want) in progress.iter().zip(expected) {
        assert!((got - want).abs() < 1e-9, "got {} want {}", got, want);
    }

    let events: Vec<&str> = checkpoints
        .iter()
        .map(|c| c.metadata["event"].as_str().unwrap())
        .collect();
    assert_eq!(events.first(), Some(&"workflow_started"));
    assert_eq!(events.last(), Some(&"workflow_completed"));
}

#[tokio::test]
async fn test_unknown_template_mutates_nothing() {
    let h = Harness::new().await;
    let dispatcher = Arc::new(Scripted::default());
    let orch = h.orchestrator(dispatcher.clone()).await;

    let err = orch.start("world_domination", context()).await.unwrap_err();
    assert!(matches!(err, GatewayError::TemplateNotFound(ref t) if t == "world_domination"));

    assert!(dispatcher.agents().is_empty());
    assert!(orch.active_workflows().await.is_empty());
    assert!(orch.completed_workflows().await.is_empty());
    assert!(orch
        .agents()
        .await
        .iter()
        .all(|a| a.status == AgentStatus::Standby));
}

#[tokio::test]
async fn test_agent_failure_ends_only_its_workflow() {
    let h = Harness::new().await;
    let dispatcher = Arc::new(Scripted::failing_at("implementation"));
    let orch = h.orchestrator(dispatcher.clone()).await;

    let report = orch.start("development_cycle", context()).await.unwrap();
    assert!(!report.succeeded());
    assert_eq!(
        report.workflow.steps_completed,
        vec!["requirements_analysis", "design_planning"]
    );
    assert!((report.workflow.progress - 0.6).abs() < 1e-9);
    assert!(matches!(
        report.workflow.outcome,
        WorkflowOutcome::Failed { ref step_id, .. } if step_id == "implementation"
    ));

    let err = report.into_result().unwrap_err();
    assert!(matches!(err, GatewayError::AgentFailure { .. }));

    // The roster is free and another template still runs
    let next = orch.start("feature_enhancement", context()).await.unwrap();
    assert!(next.succeeded());
    assert_eq!(orch.completed_workflows().await.len(), 2);
}

#[tokio::test]
async fn test_step_timeout_fails_workflow() {
    let h = Harness::new().await;
    let orch = h
        .orchestrator(Arc::new(Scripted::slow(Duration::from_millis(200))))
        .await
        .with_max_step_duration(Duration::from_millis(20));

    let report = orch.start("feature_enhancement", context()).await.unwrap();
    assert!(matches!(
        report.workflow.outcome,
        WorkflowOutcome::TimedOut { ref step_id, limit_ms: 20 } if step_id == "analysis"
    ));
    assert!(report.workflow.steps_completed.is_empty());
    assert!(matches!(
        report.into_result(),
        Err(GatewayError::StepTimeout { .. })
    ));

    // The timed-out agent was released
    let boosaan = orch.agent(AgentId::Boosaan).await.unwrap();
    assert_eq!(boosaan.status, AgentStatus::Standby);
}

#[tokio::test]
async fn test_concurrent_workflows_never_share_an_agent() {
    let h = Harness::new().await;
    let dispatcher = Arc::new(Scripted::slow(Duration::from_millis(5)));
    let orch = Arc::new(h.orchestrator(dispatcher.clone()).await);

    let runs: Vec<_> = (0..4)
        .map(|i| {
            let orch = orch.clone();
            let template = if i % 2 == 0 {
                "development_cycle"
            } else {
                "feature_enhancement"
            };
            tokio::spawn(async move { orch.start(template, Map::new()).await })
        })
        .collect();

    let mut ids = HashSet::new();
    for run in runs {
        let report = run.await.unwrap().unwrap();
        assert!(report.succeeded());
        assert!(ids.insert(report.workflow.workflow_id));
    }

    assert!(!dispatcher.overlapped.load(Ordering::SeqCst));
    assert_eq!(dispatcher.agents().len(), 2 * 5 + 2 * 4);
    assert_eq!(orch.completed_workflows().await.len(), 4);
}

#[tokio::test]
async fn test_interrupted_workflow_recovered_on_reopen() {
    let h = Harness::new().await;

    let workflow_id = {
        let orch = h.orchestrator(Arc::new(Scripted::default())).await;
        let handle = orch.begin("development_cycle", context()).await.unwrap();
        assert_eq!(orch.progress(handle.workflow_id()).await.unwrap(), 0.0);
        handle.workflow_id().to_string()
        // Dropped without running: the process "died" mid-workflow
    };

    let orch = h.orchestrator(Arc::new(Scripted::default())).await;
    assert!(orch.active_workflows().await.is_empty());

    let done = orch.completed_workflow(&workflow_id).await.unwrap();
    assert!(matches!(
        done.outcome,
        WorkflowOutcome::Failed { ref reason, .. } if reason.contains("interrupted")
    ));

    // New ids never collide with the recovered one
    let next = orch.start("development_cycle", context()).await.unwrap();
    assert_ne!(next.workflow.workflow_id, workflow_id);
}

#[tokio::test]
async fn test_second_orchestrator_cannot_take_a_live_ledger() {
    let h = Harness::new().await;
    let live = h.orchestrator(Arc::new(Scripted::default())).await;
    let handle = live.begin("development_cycle", context()).await.unwrap();

    let err = Orchestrator::open(
        h.ledger(),
        Arc::new(Scripted::default()),
        h.store.clone(),
    )
    .await
    .err()
    .unwrap();
    assert!(err.to_string().contains("in use by another process"));

    // The live instance was not recovered out from under its owner
    let doc = h.ledger().load_continuum().await.unwrap().unwrap();
    assert!(doc.active_workflows.contains_key(handle.workflow_id()));
    assert!(doc.completed_workflows.is_empty());

    let report = live.run(handle).await;
    assert!(report.succeeded());
}
