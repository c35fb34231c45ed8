//! Core types and error definitions for the Fleet dispatch workspace.
//!
//! This crate provides the foundational types shared across all Fleet crates:
//! the error taxonomy, the agent and task data model, and the boundary to the
//! Sentinel protocol that turns tasks into agent-readable text and agent
//! replies back into structured status updates.
//!
//! # Main types
//!
//! - [`FleetError`] — Unified error enum for all Fleet subsystems.
//! - [`FleetResult`] — Convenience alias for `Result<T, FleetError>`.
//! - [`ErrorKind`] — Caller-facing classification of a failure.
//! - [`Agent`] — A registered remote worker and its live accounting.
//! - [`Task`] — A unit of work that is ready to be scheduled.
//! - [`SentinelProtocol`] — Encode/decode boundary for task payloads.

/// Agent model: capabilities, status, transport and performance.
pub mod agent;
/// Sentinel protocol boundary and the default text codec.
pub mod sentinel;
/// Task model: task types, priorities and project context.
pub mod task;

pub use agent::{
    Agent, AgentDescriptor, AgentPerformance, AgentStatus, Capability, TransportKind,
};
pub use sentinel::{AgentResponse, ResponseStatus, SentinelProtocol, TextSentinel};
pub use task::{ProjectContext, Task, TaskPriority, TaskType};

use serde::{Deserialize, Serialize};

// --- Error types ---

/// Top-level error type for Fleet.
///
/// The first five variants form the taxonomy surfaced to task sources; the
/// rest are infrastructure failures that get folded into one of them at the
/// orchestrator boundary.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    /// Malformed task or agent input. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No agents are registered at all.
    #[error("Resource error: {0}")]
    Resource(String),

    /// Capability mismatch or agent-side rejection.
    #[error("Agent error: {0}")]
    Agent(String),

    /// Delivery or formatting failure for a task attempt.
    #[error("Task execution error: {0}")]
    TaskExecution(String),

    /// A monitor or receive deadline elapsed.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A referenced agent, assignment or execution does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A transport could not deliver or accept a payload.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A payload could not be encoded or decoded.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// Classify this error for callers of the orchestrator facade.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FleetError::Validation(_) | FleetError::Config(_) | FleetError::Json(_) => {
                ErrorKind::Validation
            }
            FleetError::Resource(_) => ErrorKind::Resource,
            FleetError::Agent(_) | FleetError::NotFound(_) => ErrorKind::Agent,
            FleetError::Timeout(_) => ErrorKind::Timeout,
            FleetError::TaskExecution(_)
            | FleetError::Transport(_)
            | FleetError::Protocol(_)
            | FleetError::Io(_) => ErrorKind::TaskExecution,
        }
    }

    /// Whether another attempt at the same task may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::TaskExecution | ErrorKind::Timeout)
    }
}

/// A convenience `Result` alias using [`FleetError`].
pub type FleetResult<T> = Result<T, FleetError>;

/// Caller-facing failure classification carried by execution results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input.
    Validation,
    /// Nobody registered.
    Resource,
    /// Agent-side problem.
    Agent,
    /// Delivery or formatting problem; retryable.
    TaskExecution,
    /// Deadline exceeded; retryable.
    Timeout,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::Resource => write!(f, "resource"),
            ErrorKind::Agent => write!(f, "agent"),
            ErrorKind::TaskExecution => write!(f, "task_execution"),
            ErrorKind::Timeout => write!(f, "timeout"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            FleetError::Validation("x".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(FleetError::Resource("x".into()).kind(), ErrorKind::Resource);
        assert_eq!(FleetError::NotFound("x".into()).kind(), ErrorKind::Agent);
        assert_eq!(
            FleetError::Transport("x".into()).kind(),
            ErrorKind::TaskExecution
        );
    }

    #[test]
    fn test_retryable() {
        assert!(FleetError::Timeout("slow".into()).is_retryable());
        assert!(FleetError::TaskExecution("format".into()).is_retryable());
        assert!(!FleetError::Validation("empty id".into()).is_retryable());
        assert!(!FleetError::Agent("mismatch".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = FleetError::Resource("no agents registered".into());
        assert_eq!(err.to_string(), "Resource error: no agents registered");
        assert_eq!(ErrorKind::TaskExecution.to_string(), "task_execution");
    }
}
