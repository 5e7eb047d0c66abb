//! Agent directory
//!
//! Maps roster ids onto `Agent` implementations. Agents are external
//! capabilities; out of the box every roster slot is filled by an
//! [`AcknowledgingAgent`] that accepts the task and reports what it was
//! asked to do. Integrations replace slots with [`AgentDirectory::with_agent`].

use async_trait::async_trait;
use saan_sdk::{Agent, AgentError, AgentOutput, AgentTask};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::conductor::{AgentId, StepDispatcher};

/// Default agent: accepts every task and echoes its descriptor
pub struct AcknowledgingAgent {
    id: AgentId,
}

impl AcknowledgingAgent {
    pub fn new(id: AgentId) -> Self {
        Self { id }
    }
}

#[async_trait]
impl Agent for AcknowledgingAgent {
    fn name(&self) -> &str {
        self.id.as_str()
    }

    async fn perform(&self, task: &AgentTask) -> Result<AgentOutput, AgentError> {
        let keys: Vec<&String> = task.context.keys().collect();
        Ok(
            AgentOutput::new(format!("{} completed {}", self.id.role().as_str(), task.step_id))
                .with_data(json!({
                    "agent": self.id,
                    "capabilities": self.id.capabilities(),
                    "context_keys": keys,
                })),
        )
    }
}

/// Roster id → agent implementation
#[derive(Clone)]
pub struct AgentDirectory {
    agents: HashMap<AgentId, Arc<dyn Agent>>,
}

impl Default for AgentDirectory {
    fn default() -> Self {
        Self {
            agents: AgentId::ALL
                .into_iter()
                .map(|id| (id, Arc::new(AcknowledgingAgent::new(id)) as Arc<dyn Agent>))
                .collect(),
        }
    }
}

impl AgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the implementation behind a roster id
    pub fn with_agent(mut self, id: AgentId, agent: Arc<dyn Agent>) -> Self {
        self.agents.insert(id, agent);
        self
    }

    pub fn get(&self, id: AgentId) -> Option<Arc<dyn Agent>> {
        self.agents.get(&id).cloned()
    }

    /// Run a task on the agent registered for `id`
    pub async fn perform(&self, id: AgentId, task: &AgentTask) -> Result<AgentOutput, AgentError> {
        let agent = self
            .get(id)
            .ok_or_else(|| AgentError::Unavailable(format!("no agent registered for {}", id)))?;

        debug!("Dispatching {} to {}", task.step_id, agent.name());
        agent.perform(task).await
    }

    /// `perform` bounded by `limit`
    pub async fn perform_within(
        &self,
        id: AgentId,
        task: &AgentTask,
        limit: Duration,
    ) -> Result<AgentOutput, AgentError> {
        match tokio::time::timeout(limit, self.perform(id, task)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::TimedOut {
                limit_ms: limit.as_millis() as u64,
            }),
        }
    }
}

#[async_trait]
impl StepDispatcher for AgentDirectory {
    async fn dispatch(
        &self,
        agent: AgentId,
        task: &AgentTask,
        limit: Duration,
    ) -> Result<AgentOutput, AgentError> {
        self.perform_within(agent, task, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Map;

    const LIMIT: Duration = Duration::from_secs(5);

    fn task(step: &str) -> AgentTask {
        let mut context = Map::new();
        context.insert("project_name".into(), json!("X"));
        AgentTask {
            workflow_id: "wf".into(),
            step_id: step.into(),
            context,
            assigned_at: Utc::now(),
        }
    }

    struct Refuses;

    #[async_trait]
    impl Agent for Refuses {
        fn name(&self) -> &str {
            "refuses"
        }

        async fn perform(&self, _task: &AgentTask) -> Result<AgentOutput, AgentError> {
            Err(AgentError::Failed("no".into()))
        }
    }

    struct Stalls;

    #[async_trait]
    impl Agent for Stalls {
        fn name(&self) -> &str {
            "stalls"
        }

        async fn perform(&self, _task: &AgentTask) -> Result<AgentOutput, AgentError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(AgentOutput::new("late"))
        }
    }

    #[tokio::test]
    async fn test_default_agents_acknowledge() {
        let dir = AgentDirectory::new();
        let out = dir
            .dispatch(AgentId::Oolsaan, &task("quality_assurance"), LIMIT)
            .await
            .unwrap();
        assert_eq!(out.summary, "quality_assurance completed quality_assurance");
        assert_eq!(out.data["agent"], "oolsaan");
        assert_eq!(out.data["context_keys"], json!(["project_name"]));
    }

    #[tokio::test]
    async fn test_with_agent_replaces_slot() {
        let dir = AgentDirectory::new().with_agent(AgentId::Ilsaan, Arc::new(Refuses));
        let err = dir
            .dispatch(AgentId::Ilsaan, &task("deployment_preparation"), LIMIT)
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::Failed("no".into()));
        assert!(dir
            .dispatch(AgentId::Boosaan, &task("x"), LIMIT)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_perform_within_reports_overrun() {
        let dir = AgentDirectory::new().with_agent(AgentId::Boosaan, Arc::new(Stalls));
        let err = dir
            .perform_within(AgentId::Boosaan, &task("x"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::TimedOut { limit_ms: 50 });
    }
}
