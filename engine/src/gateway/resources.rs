//! Read-only resources served through `resources/list` and `resources/read`

use saan_sdk::GatewayError;
use serde_json::{json, Value};
use std::str::FromStr;

use super::Gateway;

const MIME_JSON: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceUri {
    SessionInfo,
    SessionStatistics,
    ActiveWorkflows,
    AgentRoster,
}

impl ResourceUri {
    pub const ALL: [ResourceUri; 4] = [
        ResourceUri::SessionInfo,
        ResourceUri::SessionStatistics,
        ResourceUri::ActiveWorkflows,
        ResourceUri::AgentRoster,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceUri::SessionInfo => "session://info",
            ResourceUri::SessionStatistics => "session://statistics",
            ResourceUri::ActiveWorkflows => "workflow://active",
            ResourceUri::AgentRoster => "agent://roster",
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ResourceUri::SessionInfo => "Session information",
            ResourceUri::SessionStatistics => "Session statistics",
            ResourceUri::ActiveWorkflows => "Active workflows",
            ResourceUri::AgentRoster => "Agent roster",
        }
    }

    pub fn describe(&self) -> Value {
        json!({
            "uri": self.as_str(),
            "name": self.name(),
            "mimeType": MIME_JSON,
        })
    }
}

impl FromStr for ResourceUri {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceUri::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| GatewayError::UnknownResource(s.to_string()))
    }
}

/// `{"resources": [...]}`
pub fn catalog() -> Value {
    let resources: Vec<Value> = ResourceUri::ALL.iter().map(ResourceUri::describe).collect();
    json!({ "resources": resources })
}

impl Gateway {
    pub(crate) async fn read_resource(&self, params: &Value) -> Result<Value, GatewayError> {
        let uri = params
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::InvalidParams("missing resource uri".into()))?;
        let resource = ResourceUri::from_str(uri)?;

        let body = match resource {
            ResourceUri::SessionInfo => self.session.info().await,
            ResourceUri::SessionStatistics => self.session.statistics(true).await?,
            ResourceUri::ActiveWorkflows => {
                json!({ "active": self.orchestrator.active_workflows().await })
            }
            ResourceUri::AgentRoster => json!({ "agents": self.orchestrator.agents().await }),
        };

        let text = serde_json::to_string_pretty(&body)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        Ok(json!({
            "contents": [{
                "uri": uri,
                "mimeType": MIME_JSON,
                "text": text,
            }]
        }))
    }
}
