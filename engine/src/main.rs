// SAAN gateway
// Main entry point for the saan binary

use clap::Parser;
use saan_engine::cli::{Cli, Command, WorkflowAction};
use saan_engine::config::Config;
use saan_engine::handlers::{
    handle_agents, handle_history, handle_serve, handle_workflow_list, handle_workflow_start,
    OutputFormat,
};
use saan_engine::telemetry::init_telemetry_with_level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_or_create_at(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log wins over the config file; RUST_LOG wins over both
    init_telemetry_with_level(cli.log.as_deref(), &config.core.log_level);

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");

    tracing::info!("SAAN v{} ({} - {})", version, commit, timestamp);

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    match cli.command {
        Command::Serve => handle_serve(&config).await,

        Command::Workflow { action } => match action {
            WorkflowAction::Start { template, context } => {
                tracing::info!("Starting workflow from template {}", template);
                handle_workflow_start(template, context, &config, format).await
            }
            WorkflowAction::List => handle_workflow_list(&config, format).await,
        },

        Command::Agents => handle_agents(&config, format).await,

        Command::History { limit, session } => {
            tracing::info!("Showing last {} tasks", limit);
            handle_history(limit, session, &config, format).await
        }
    }
}
