//! SAAN SDK
//!
//! Shared library providing the agent contract, wire types and the error
//! taxonomy. It is used by the engine and by agent implementations.

/// Agent trait and task descriptors
pub mod agent;

/// Error types and handling
pub mod errors;

/// Request/response and risk types
pub mod types;

// Re-export commonly used types
pub use agent::{Agent, AgentError, AgentOutput, AgentTask};
pub use errors::{GatewayError, GatewayErrorExt, LoopScope};
pub use types::{RiskAssessment, RiskLevel, RiskScores, RpcError, RpcRequest};
