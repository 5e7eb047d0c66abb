//! SAAN gateway
//!
//! Every request runs the same pipeline: risk gate, loop detector, method
//! dispatch, audit. Rejections at the gate or the detector are audited as
//! `BLOCKED`; everything else is audited with the status its response implies.

pub mod dispatcher;
pub mod resources;
pub mod session;
pub mod tools;

use anyhow::{Context, Result};
use chrono::Utc;
use saan_sdk::types::{text_content, PROTOCOL_VERSION};
use saan_sdk::{GatewayError, RpcRequest};
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::agents::AgentDirectory;
use crate::conductor::Orchestrator;
use crate::config::Config;
use crate::db::AuditStore;

pub use dispatcher::{GatedDispatcher, STEP_METHOD};
pub use resources::ResourceUri;
pub use session::{
    derive_session_id, Completion, PerformanceMetrics, Session, SessionContext, Tracking,
};
pub use tools::ToolName;

pub const SERVER_NAME: &str = "saan-gateway";

/// Methods the gateway answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Initialize,
    ToolsList,
    ToolsCall,
    ResourcesList,
    ResourcesRead,
}

impl FromStr for Method {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialize" => Ok(Method::Initialize),
            "tools/list" => Ok(Method::ToolsList),
            "tools/call" => Ok(Method::ToolsCall),
            "resources/list" => Ok(Method::ResourcesList),
            "resources/read" => Ok(Method::ResourcesRead),
            other => Err(GatewayError::UnknownMethod(other.to_string())),
        }
    }
}

pub struct Gateway {
    session: Arc<Session>,
    orchestrator: Arc<Orchestrator>,
}

impl Gateway {
    /// Open the audit store, session and orchestrator described by `config`
    pub async fn open(config: &Config, agents: AgentDirectory) -> Result<Self> {
        let session_id = config
            .core
            .session_id
            .clone()
            .unwrap_or_else(|| derive_session_id(Utc::now()));

        let store = AuditStore::open(&config.audit_db_path(&session_id), session_id.as_str())
            .await
            .context("Failed to open audit store")?;
        let store = Arc::new(store);

        let session = Arc::new(
            Session::open(
                store.clone(),
                config.gate.clone(),
                config.loop_guard.clone(),
                config.audit.clone(),
            )
            .await?,
        );

        let dispatcher = Arc::new(GatedDispatcher::new(session.clone(), agents));
        let orchestrator = Orchestrator::open(config.ledger(), dispatcher, store)
            .await
            .context("Failed to open workflow ledger")?;

        Ok(Self::from_parts(session, Arc::new(orchestrator)))
    }

    pub fn from_parts(session: Arc<Session>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            session,
            orchestrator,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Run one request through gate, detector, dispatch and audit
    pub async fn handle_request(&self, request: &RpcRequest) -> Value {
        let now = Utc::now();
        let entry = Completion::new(request, now);

        if let Some(assessment) = self.session.gate(&request.method, &request.params) {
            return self
                .session
                .commit(entry.blocked(), |t| {
                    GatewayError::RiskRejected {
                        conversation_id: t.conversation_id.clone(),
                        assessment,
                    }
                    .to_rpc_error()
                    .into_response()
                })
                .await;
        }

        let verdict = self
            .session
            .loop_check(&request.method, &request.params, now)
            .await;
        if verdict.is_runaway() {
            let window = self.session.loop_limits().window_secs;
            return self
                .session
                .commit(entry.blocked(), |t| {
                    verdict
                        .into_error(&t.conversation_id, window)
                        .map(|e| e.to_rpc_error().into_response())
                        .unwrap_or_default()
                })
                .await;
        }

        let result = self.dispatch(request).await;
        self.session
            .commit(entry, |t| match result {
                Ok(mut response) => {
                    if response.get("content").is_some() {
                        response["tracking"] = t.to_value();
                    }
                    response
                }
                Err(e) => error_response(&e, t),
            })
            .await
    }

    async fn dispatch(&self, request: &RpcRequest) -> Result<Value, GatewayError> {
        let method = Method::from_str(&request.method)?;
        debug!("Dispatching {:?}", method);

        match method {
            Method::Initialize => Ok(self.initialize()),
            Method::ToolsList => Ok(tools::catalog()),
            Method::ToolsCall => {
                let name = request
                    .tool_name()
                    .ok_or_else(|| GatewayError::InvalidParams("missing tool name".into()))?;
                let tool = ToolName::from_str(name)?;
                let result = self.call_tool(tool, request.arguments()).await?;
                let text = serde_json::to_string_pretty(&result)
                    .map_err(|e| GatewayError::Internal(e.to_string()))?;
                Ok(text_content(text))
            }
            Method::ResourcesList => Ok(resources::catalog()),
            Method::ResourcesRead => self.read_resource(&request.params).await,
        }
    }

    fn initialize(&self) -> Value {
        info!("Client initialized session {}", self.session.session_id());
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": {},
                "resources": {},
                "logging": {},
            },
            "serverInfo": {
                "name": SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
        })
    }

    /// Write a final snapshot and flush the store
    pub async fn shutdown(&self) -> Result<()> {
        self.session.persist().await;
        self.session.store().flush().await
    }
}

/// Error response tagged with the conversation that carried it
fn error_response(err: &GatewayError, tracking: &Tracking) -> Value {
    let mut rpc = err.to_rpc_error();
    if rpc.data.is_none() {
        rpc = rpc.with_data(json!({ "conversation_id": tracking.conversation_id }));
    }
    rpc.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parsing() {
        assert_eq!(Method::from_str("tools/call").unwrap(), Method::ToolsCall);
        assert!(matches!(
            Method::from_str("prompts/list"),
            Err(GatewayError::UnknownMethod(_))
        ));
    }

    #[test]
    fn test_error_response_carries_conversation_id() {
        let tracking = Tracking {
            conversation_id: "S_CONV_000007".into(),
            task_id: None,
            session_id: "S".into(),
            timestamp: Utc::now(),
        };
        let resp = error_response(&GatewayError::UnknownTool("nope".into()), &tracking);
        assert_eq!(resp["error"]["code"], -32601);
        assert_eq!(resp["error"]["data"]["conversation_id"], "S_CONV_000007");
    }
}
