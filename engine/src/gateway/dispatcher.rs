//! Gated step dispatch
//!
//! Workflow steps go through the same risk gate, loop detector and audit
//! trail as external requests, as method `workflow/step` named after the step.

use async_trait::async_trait;
use chrono::Utc;
use saan_sdk::errors::CODE_INTERNAL;
use saan_sdk::{AgentError, AgentOutput, AgentTask, GatewayError, RpcError, RpcRequest};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::session::{Completion, Session};
use crate::agents::AgentDirectory;
use crate::conductor::{AgentId, StepDispatcher};

pub const STEP_METHOD: &str = "workflow/step";

pub struct GatedDispatcher {
    session: Arc<Session>,
    agents: AgentDirectory,
}

impl GatedDispatcher {
    pub fn new(session: Arc<Session>, agents: AgentDirectory) -> Self {
        Self { session, agents }
    }
}

#[async_trait]
impl StepDispatcher for GatedDispatcher {
    async fn dispatch(
        &self,
        agent: AgentId,
        task: &AgentTask,
        limit: Duration,
    ) -> Result<AgentOutput, AgentError> {
        let request = RpcRequest::new(
            STEP_METHOD,
            json!({
                "name": task.step_id,
                "workflow_id": task.workflow_id,
                "agent": agent,
            }),
        );
        let now = Utc::now();
        let entry = Completion::new(&request, now).with_work_item(task.step_id.clone());

        if let Some(assessment) = self.session.gate(STEP_METHOD, &request.params) {
            let total = assessment.total;
            self.session
                .commit(entry.blocked(), |t| {
                    GatewayError::RiskRejected {
                        conversation_id: t.conversation_id.clone(),
                        assessment,
                    }
                    .to_rpc_error()
                    .into_response()
                })
                .await;
            return Err(AgentError::Rejected(format!(
                "risk {} at step {}",
                total, task.step_id
            )));
        }

        let verdict = self.session.loop_check(STEP_METHOD, &request.params, now).await;
        if verdict.is_runaway() {
            let window = self.session.loop_limits().window_secs;
            warn!("Loop protection stopped step {}", task.step_id);
            let message = self
                .session
                .commit(entry.blocked(), |t| {
                    verdict
                        .into_error(&t.conversation_id, window)
                        .map(|e| e.to_rpc_error().into_response())
                        .unwrap_or_default()
                })
                .await;
            return Err(AgentError::Rejected(
                message["error"]["message"]
                    .as_str()
                    .unwrap_or("loop protection")
                    .to_string(),
            ));
        }

        let result = self.agents.perform_within(agent, task, limit).await;
        if let Err(AgentError::TimedOut { limit_ms }) = &result {
            warn!("Step {} abandoned after {}ms", task.step_id, limit_ms);
        }
        self.session
            .commit(entry, |_| match &result {
                Ok(output) => json!({ "agent": agent, "output": output }),
                Err(e) => RpcError::new(CODE_INTERNAL, e.to_string()).into_response(),
            })
            .await;

        result
    }
}
