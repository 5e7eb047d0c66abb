//! Gateway tools
//!
//! The closed set of tools reachable through `tools/call`. Each tool parses
//! its `arguments` into a typed struct and returns a JSON value; the gateway
//! wraps that value as text content and attaches tracking ids.

use chrono::{Duration, Utc};
use saan_sdk::GatewayError;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::str::FromStr;
use tracing::{debug, info, warn};

use super::Gateway;
use crate::db::{hours_span, RecordStatus};

/// Tools advertised by `tools/list`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolName {
    SessionInfo,
    SearchConversationHistory,
    GetTaskHistory,
    RestorePreviousContext,
    GetSessionStatistics,
    RememberContext,
    StartWorkflow,
    WorkflowProgress,
    ListWorkflows,
    AgentStatus,
}

impl ToolName {
    pub const ALL: [ToolName; 10] = [
        ToolName::SessionInfo,
        ToolName::SearchConversationHistory,
        ToolName::GetTaskHistory,
        ToolName::RestorePreviousContext,
        ToolName::GetSessionStatistics,
        ToolName::RememberContext,
        ToolName::StartWorkflow,
        ToolName::WorkflowProgress,
        ToolName::ListWorkflows,
        ToolName::AgentStatus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::SessionInfo => "session_info",
            ToolName::SearchConversationHistory => "search_conversation_history",
            ToolName::GetTaskHistory => "get_task_history",
            ToolName::RestorePreviousContext => "restore_previous_context",
            ToolName::GetSessionStatistics => "get_session_statistics",
            ToolName::RememberContext => "remember_context",
            ToolName::StartWorkflow => "start_workflow",
            ToolName::WorkflowProgress => "workflow_progress",
            ToolName::ListWorkflows => "list_workflows",
            ToolName::AgentStatus => "agent_status",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            ToolName::SessionInfo => "Current session id, uptime and counters",
            ToolName::SearchConversationHistory => {
                "Search stored requests and responses of this session"
            }
            ToolName::GetTaskHistory => "Task records, newest first",
            ToolName::RestorePreviousContext => {
                "Restore the newest context snapshot inside a time window"
            }
            ToolName::GetSessionStatistics => "Aggregate statistics for this session",
            ToolName::RememberContext => "Store a value in session short-term memory",
            ToolName::StartWorkflow => "Start a workflow from a template",
            ToolName::WorkflowProgress => "Progress of a workflow instance",
            ToolName::ListWorkflows => "Active and completed workflows",
            ToolName::AgentStatus => "Agent roster and current assignments",
        }
    }

    fn input_schema(&self) -> Value {
        match self {
            ToolName::SessionInfo | ToolName::ListWorkflows | ToolName::AgentStatus => json!({
                "type": "object",
                "properties": {},
            }),
            ToolName::SearchConversationHistory => json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Substring to look for"},
                    "time_range_hours": {"type": "integer", "default": 24},
                    "limit": {"type": "integer", "default": 10},
                },
                "required": ["query"],
            }),
            ToolName::GetTaskHistory => json!({
                "type": "object",
                "properties": {
                    "task_type": {"type": "string"},
                    "status": {"type": "string", "enum": ["COMPLETED", "ERROR", "BLOCKED"]},
                    "limit": {"type": "integer", "default": 20},
                },
            }),
            ToolName::RestorePreviousContext => json!({
                "type": "object",
                "properties": {
                    "hours_back": {"type": "integer", "default": 24},
                },
            }),
            ToolName::GetSessionStatistics => json!({
                "type": "object",
                "properties": {
                    "include_performance": {"type": "boolean", "default": true},
                },
            }),
            ToolName::RememberContext => json!({
                "type": "object",
                "properties": {
                    "key": {"type": "string"},
                    "value": {},
                },
                "required": ["key", "value"],
            }),
            ToolName::StartWorkflow => json!({
                "type": "object",
                "properties": {
                    "template": {"type": "string"},
                    "context": {"type": "object", "default": {}},
                    "wait": {"type": "boolean", "default": false},
                },
                "required": ["template"],
            }),
            ToolName::WorkflowProgress => json!({
                "type": "object",
                "properties": {
                    "workflow_id": {"type": "string"},
                },
                "required": ["workflow_id"],
            }),
        }
    }

    /// Catalog entry for `tools/list`
    pub fn describe(&self) -> Value {
        json!({
            "name": self.as_str(),
            "description": self.description(),
            "inputSchema": self.input_schema(),
        })
    }
}

impl FromStr for ToolName {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolName::ALL
            .into_iter()
            .find(|tool| tool.as_str() == s)
            .ok_or_else(|| GatewayError::UnknownTool(s.to_string()))
    }
}

/// `{"tools": [...]}`
pub fn catalog() -> Value {
    let tools: Vec<Value> = ToolName::ALL.iter().map(ToolName::describe).collect();
    json!({ "tools": tools })
}

#[derive(Debug, Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default = "default_hours")]
    time_range_hours: u64,
    #[serde(default = "default_search_limit")]
    limit: i64,
}

#[derive(Debug, Deserialize)]
struct TaskHistoryArgs {
    #[serde(default)]
    task_type: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default = "default_history_limit")]
    limit: i64,
}

#[derive(Debug, Deserialize)]
struct RestoreArgs {
    #[serde(default = "default_hours")]
    hours_back: u64,
}

#[derive(Debug, Deserialize)]
struct StatisticsArgs {
    #[serde(default = "default_true")]
    include_performance: bool,
}

#[derive(Debug, Deserialize)]
struct RememberArgs {
    key: String,
    value: Value,
}

#[derive(Debug, Deserialize)]
struct StartWorkflowArgs {
    template: String,
    #[serde(default)]
    context: Map<String, Value>,
    #[serde(default)]
    wait: bool,
}

#[derive(Debug, Deserialize)]
struct ProgressArgs {
    workflow_id: String,
}

fn default_hours() -> u64 {
    24
}

fn default_search_limit() -> i64 {
    10
}

fn default_history_limit() -> i64 {
    20
}

fn default_true() -> bool {
    true
}

fn parse_args<T: DeserializeOwned>(tool: ToolName, args: Value) -> Result<T, GatewayError> {
    // Clients commonly send `null` for "no arguments"
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args)
        .map_err(|e| GatewayError::InvalidParams(format!("{}: {}", tool.as_str(), e)))
}

fn positive_limit(limit: i64) -> Result<i64, GatewayError> {
    if limit <= 0 {
        return Err(GatewayError::InvalidParams(
            "limit must be greater than 0".into(),
        ));
    }
    Ok(limit)
}

fn lookback(hours: u64, field: &str) -> Result<Duration, GatewayError> {
    hours_span(hours)
        .ok_or_else(|| GatewayError::InvalidParams(format!("{} is out of range", field)))
}

fn store_error(e: anyhow::Error) -> GatewayError {
    GatewayError::StoreUnavailable(format!("{:#}", e))
}

impl Gateway {
    /// Execute one tool and return its result payload
    pub(crate) async fn call_tool(&self, tool: ToolName, args: Value) -> Result<Value, GatewayError> {
        debug!("Calling tool {}", tool.as_str());

        match tool {
            ToolName::SessionInfo => Ok(self.session.info().await),

            ToolName::SearchConversationHistory => {
                let args: SearchArgs = parse_args(tool, args)?;
                let limit = positive_limit(args.limit)?;
                let span = lookback(args.time_range_hours, "time_range_hours")?;
                let since = Utc::now().checked_sub_signed(span).ok_or_else(|| {
                    GatewayError::InvalidParams("time_range_hours is out of range".into())
                })?;
                let matches = self
                    .session
                    .store()
                    .search(&args.query, since, limit)
                    .await
                    .map_err(store_error)?;

                Ok(json!({
                    "query": args.query,
                    "time_range_hours": args.time_range_hours,
                    "count": matches.len(),
                    "results": matches,
                }))
            }

            ToolName::GetTaskHistory => {
                let args: TaskHistoryArgs = parse_args(tool, args)?;
                let limit = positive_limit(args.limit)?;
                let status = args
                    .status
                    .as_deref()
                    .map(RecordStatus::from_str)
                    .transpose()
                    .map_err(|e| GatewayError::InvalidParams(e.to_string()))?;
                let tasks = self
                    .session
                    .store()
                    .task_history(args.task_type.as_deref(), status, limit)
                    .await
                    .map_err(store_error)?;

                Ok(json!({ "count": tasks.len(), "tasks": tasks }))
            }

            ToolName::RestorePreviousContext => {
                let args: RestoreArgs = parse_args(tool, args)?;
                let context = self
                    .session
                    .restore_context(lookback(args.hours_back, "hours_back")?)
                    .await?;
                info!(
                    "Context restored with {} memory entries",
                    context.context_memory.len()
                );

                Ok(json!({
                    "restored": true,
                    "hours_back": args.hours_back,
                    "context": context,
                }))
            }

            ToolName::GetSessionStatistics => {
                let args: StatisticsArgs = parse_args(tool, args)?;
                self.session.statistics(args.include_performance).await
            }

            ToolName::RememberContext => {
                let args: RememberArgs = parse_args(tool, args)?;
                if args.key.trim().is_empty() {
                    return Err(GatewayError::InvalidParams("key must not be empty".into()));
                }
                let entries = self.session.remember(args.key.clone(), args.value).await;
                Ok(json!({ "stored": args.key, "memory_entries": entries }))
            }

            ToolName::StartWorkflow => {
                let args: StartWorkflowArgs = parse_args(tool, args)?;
                self.start_workflow(args).await
            }

            ToolName::WorkflowProgress => {
                let args: ProgressArgs = parse_args(tool, args)?;
                let progress = self.orchestrator.progress(&args.workflow_id).await?;
                Ok(json!({ "workflow_id": args.workflow_id, "progress": progress }))
            }

            ToolName::ListWorkflows => {
                let templates: Vec<String> = self
                    .orchestrator
                    .templates()
                    .await
                    .iter()
                    .map(|t| t.name().to_string())
                    .collect();
                Ok(json!({
                    "templates": templates,
                    "active": self.orchestrator.active_workflows().await,
                    "completed": self.orchestrator.completed_workflows().await,
                }))
            }

            ToolName::AgentStatus => Ok(json!({ "agents": self.orchestrator.agents().await })),
        }
    }

    async fn start_workflow(&self, args: StartWorkflowArgs) -> Result<Value, GatewayError> {
        let handle = self.orchestrator.begin(&args.template, args.context).await?;
        let workflow_id = handle.workflow_id().to_string();
        let steps: Vec<&str> = handle
            .template()
            .steps()
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        let mut summary = json!({
            "workflow_id": workflow_id,
            "template": args.template,
            "steps": steps,
        });

        if args.wait {
            let report = self.orchestrator.run(handle).await.into_result()?;
            return serde_json::to_value(&report)
                .map_err(|e| GatewayError::Internal(e.to_string()));
        }

        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            let report = orchestrator.run(handle).await;
            if !report.succeeded() {
                warn!(
                    "Workflow {} finished unsuccessfully",
                    report.workflow.workflow_id
                );
            }
        });

        summary["status"] = json!("running");
        Ok(summary)
    }
}
