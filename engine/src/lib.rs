//! SAAN Engine Library
//!
//! This library provides the core functionality of the SAAN gateway.
//! It is used by both the main binary and integration tests.

/// Agent directory and default agents
pub mod agents;

/// CLI interface module
pub mod cli;

/// Workflow orchestration module
pub mod conductor;

/// Configuration management module
pub mod config;

/// Audit and snapshot store
pub mod db;

/// Request pipeline: gate, loop detector, dispatch, audit
pub mod gateway;

/// Command handlers module
pub mod handlers;

/// Loop and abuse detection module
pub mod loop_detector;

/// Risk assessment module
pub mod risk_assessor;

/// Line-delimited JSON-RPC transport
pub mod server;

/// Telemetry and Observability
pub mod telemetry;
