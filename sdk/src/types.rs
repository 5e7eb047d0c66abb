//! Wire types shared between the gateway and its callers

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Protocol version advertised by `initialize`
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Inbound request as read from the transport
///
/// `id` and `jsonrpc` are optional; when present they are echoed back on the
/// response so standard JSON-RPC clients can correlate replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default = "empty_object")]
    pub params: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl RpcRequest {
    /// Create a request without an id
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: None,
            id: None,
            method: method.into(),
            params,
        }
    }

    /// `params.name` for `tools/call` style requests
    pub fn tool_name(&self) -> Option<&str> {
        self.params.get("name").and_then(|v| v.as_str())
    }

    /// `params.arguments`, or an empty object when absent
    pub fn arguments(&self) -> Value {
        self.params
            .get("arguments")
            .cloned()
            .unwrap_or_else(empty_object)
    }

    /// Serialize to the JSON shape stored in the audit trail
    pub fn to_value(&self) -> Value {
        json!({ "method": self.method, "params": self.params })
    }
}

/// Error object carried in `{ "error": ... }` responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Wrap into a full response object
    pub fn into_response(self) -> Value {
        json!({ "error": self })
    }
}

/// Build a `{content: [{type: "text", text}]}` tool response
pub fn text_content(text: impl Into<String>) -> Value {
    json!({
        "content": [
            { "type": "text", "text": text.into() }
        ]
    })
}

/// Whether a response object represents a failure
pub fn is_error_response(response: &Value) -> bool {
    response.get("error").is_some()
}

/// Risk level derived from the total risk score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Step function over the total score: LOW < 15 ≤ MEDIUM < 25 ≤ HIGH < 35 ≤ CRITICAL
    pub fn from_total(total: u32) -> Self {
        match total {
            t if t >= 35 => RiskLevel::Critical,
            t if t >= 25 => RiskLevel::High,
            t if t >= 15 => RiskLevel::Medium,
            _ => RiskLevel::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }
}

/// Per-dimension risk scores
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskScores {
    pub security: u32,
    pub functional: u32,
    pub contextual: u32,
    pub performance: u32,
    pub operational: u32,
}

impl RiskScores {
    pub fn total(&self) -> u32 {
        self.security + self.functional + self.contextual + self.performance + self.operational
    }
}

/// Result of assessing a single request
///
/// Ephemeral; only persisted when embedded in a BLOCKED audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub scores: RiskScores,
    pub total: u32,
    pub level: RiskLevel,
}

impl RiskAssessment {
    pub fn from_scores(scores: RiskScores) -> Self {
        let total = scores.total();
        Self {
            scores,
            total,
            level: RiskLevel::from_total(total),
        }
    }
}
