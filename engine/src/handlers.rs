//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - serve: run the stdio gateway
//! - workflow start / list: drive and inspect the workflow ledger
//! - agents: show the roster
//! - history: show recent task records

use anyhow::{bail, Context, Result};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tokio::io::BufReader;

use crate::agents::AgentDirectory;
use crate::conductor::{AgentRecord, AgentRegistryDoc, TaskContinuumDoc, WorkflowOutcome};
use crate::config::Config;
use crate::db::AuditStore;
use crate::gateway::Gateway;
use crate::server;

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Serve JSON-RPC on stdin/stdout until input closes
pub async fn handle_serve(config: &Config) -> Result<()> {
    let gateway = Gateway::open(config, AgentDirectory::new()).await?;
    tracing::info!(
        "SAAN gateway listening on stdio (session {})",
        gateway.session().session_id()
    );

    let reader = BufReader::new(tokio::io::stdin());
    let answered = server::serve(&gateway, reader, tokio::io::stdout()).await?;

    if let Err(e) = gateway.shutdown().await {
        tracing::error!("Shutdown flush failed: {:#}", e);
    }
    tracing::info!("Gateway stopped after {} requests", answered);
    Ok(())
}

/// Run a workflow in-process and print its report
///
/// Steps pass through the same gate, loop detector and audit trail as
/// requests arriving over stdio.
pub async fn handle_workflow_start(
    template: String,
    context: Option<String>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let context = parse_context(context.as_deref())?;
    let gateway = Gateway::open(config, AgentDirectory::new()).await?;

    let report = gateway.orchestrator().start(&template, context).await?;
    if let Err(e) = gateway.shutdown().await {
        tracing::error!("Shutdown flush failed: {:#}", e);
    }

    match format {
        OutputFormat::Text => {
            let wf = &report.workflow;
            println!("Workflow: {}", wf.workflow_id);
            println!("Template: {}", wf.template);
            println!("Progress: {:.0}%", wf.progress * 100.0);
            println!();
            for step in &report.outputs {
                println!("  {} [{}] {}", step.step_id, step.agent, step.output.summary);
            }
            println!();
            match &wf.outcome {
                WorkflowOutcome::Succeeded => println!("Result: succeeded"),
                WorkflowOutcome::Failed { step_id, reason } => {
                    println!("Result: failed at {} ({})", step_id, reason)
                }
                WorkflowOutcome::TimedOut { step_id, limit_ms } => {
                    println!("Result: {} exceeded {}ms", step_id, limit_ms)
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    report.into_result()?;
    Ok(())
}

/// List active and completed workflows from the ledger
pub async fn handle_workflow_list(config: &Config, format: OutputFormat) -> Result<()> {
    let continuum = config
        .ledger()
        .load_continuum()
        .await?
        .unwrap_or_else(TaskContinuumDoc::fresh);

    match format {
        OutputFormat::Text => {
            println!("Active workflows ({}):", continuum.active_workflows.len());
            for wf in continuum.active_workflows.values() {
                println!(
                    "  {} {} {:.0}% at {}",
                    wf.workflow_id,
                    wf.template,
                    wf.progress() * 100.0,
                    wf.current_step.as_deref().unwrap_or("-")
                );
            }
            println!();
            println!(
                "Completed workflows ({}):",
                continuum.completed_workflows.len()
            );
            for wf in continuum.completed_workflows.values() {
                let result = match &wf.outcome {
                    WorkflowOutcome::Succeeded => "succeeded".to_string(),
                    WorkflowOutcome::Failed { step_id, .. } => format!("failed at {}", step_id),
                    WorkflowOutcome::TimedOut { step_id, .. } => {
                        format!("timed out at {}", step_id)
                    }
                };
                println!(
                    "  {} {} {} ({})",
                    wf.workflow_id,
                    wf.template,
                    result,
                    wf.completed_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "active": continuum.active_workflows.values().collect::<Vec<_>>(),
                "completed": continuum.completed_workflows.values().collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Show the agent roster
pub async fn handle_agents(config: &Config, format: OutputFormat) -> Result<()> {
    let agents = config
        .ledger()
        .load_registry()
        .await?
        .map(|doc| doc.agents)
        .unwrap_or_else(|| AgentRegistryDoc::fresh().agents);

    match format {
        OutputFormat::Text => {
            println!("Agents:");
            for agent in &agents {
                println!("  {}", describe_agent(agent));
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&json!({ "agents": agents }))?);
        }
    }

    Ok(())
}

fn describe_agent(agent: &AgentRecord) -> String {
    let task = agent
        .current_task
        .as_ref()
        .map(|t| format!(" -> {} ({})", t.step_id, t.workflow_id))
        .unwrap_or_default();
    format!(
        "{:<11} {:<24} {:?}{}",
        agent.id.as_str(),
        agent.role.as_str(),
        agent.status,
        task
    )
}

/// Show the newest task records of a session
pub async fn handle_history(
    limit: i64,
    session: Option<String>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    if limit <= 0 {
        bail!("--limit must be greater than 0");
    }

    let session_id = match session.or_else(|| config.core.session_id.clone()) {
        Some(id) => id,
        None => latest_session(&config.core.data_dir.join("audit"))?
            .context("No audit sessions found")?,
    };

    let db_path = config.audit_db_path(&session_id);
    if !db_path.exists() {
        bail!("No audit database for session {}", session_id);
    }

    let store = AuditStore::open(&db_path, session_id.as_str())
        .await
        .context("Failed to open audit store")?;
    let tasks = store
        .task_history(None, None, limit)
        .await
        .context("Failed to fetch task history")?;

    match format {
        OutputFormat::Text => {
            println!("Session {} ({} tasks):", session_id, tasks.len());
            println!();
            for task in &tasks {
                println!(
                    "  {} {:<9} {:<28} {}",
                    task.created_at.format("%Y-%m-%d %H:%M:%S"),
                    task.status.as_str(),
                    task.task_type,
                    task.task_id
                );
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "session_id": session_id,
                "tasks": tasks,
                "count": tasks.len(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    store.close().await
}

/// Session id of the most recently modified audit database
fn latest_session(audit_dir: &Path) -> Result<Option<String>> {
    if !audit_dir.exists() {
        return Ok(None);
    }

    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(audit_dir).context("Failed to read audit directory")? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("db") {
            continue;
        }
        let modified = std::fs::metadata(&path)?.modified()?;
        if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
            newest = Some((modified, path));
        }
    }

    Ok(newest.and_then(|(_, path)| {
        path.file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
    }))
}

/// Parse `--context` into a JSON object
fn parse_context(raw: Option<&str>) -> Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(raw).context("--context is not valid JSON")? {
        Value::Object(map) => Ok(map),
        _ => bail!("--context must be a JSON object"),
    }
}
