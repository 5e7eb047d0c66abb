//! CLI interface for SAAN
//!
//! This module provides the command-line interface using clap's derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// SAAN gateway
///
/// Gated, audited JSON-RPC front door for a roster of cooperating agents,
/// with template-driven workflows and resumable session context.
#[derive(Parser, Debug)]
#[command(name = "saan")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve JSON-RPC over stdin/stdout
    Serve,

    /// Run and inspect workflows
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },

    /// Show the agent roster
    Agents,

    /// Show task history
    History {
        /// Number of tasks to show
        #[arg(short, long, default_value = "10")]
        limit: i64,

        /// Session to read; defaults to the most recently active one
        #[arg(long)]
        session: Option<String>,
    },
}

/// Workflow actions
#[derive(Subcommand, Debug)]
pub enum WorkflowAction {
    /// Run a workflow to completion and print its report
    Start {
        /// Template name
        template: String,

        /// Workflow context as a JSON object
        #[arg(long, value_name = "JSON")]
        context: Option<String>,
    },

    /// List active and completed workflows
    List,
}
