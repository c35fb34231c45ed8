//! Task-to-agent dispatch engine for Fleet.
//!
//! Matches incoming tasks to registered agents by capability, load,
//! performance and project affinity, delivers them over each agent's
//! transport, and drives every assignment through its lifecycle with
//! timeouts, retries and heartbeat-based liveness.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Facade owning the registry, queue and assignments.
//! - [`AgentRegistry`] — Authoritative set of agents with per-agent locking.
//! - [`Selector`] — Deterministic agent selection over a [`CapabilityMatcher`].
//! - [`AssignmentBook`] — Assignment state machine, one open assignment per task.
//! - [`LivenessMonitor`] — Heartbeat sweep with capped adaptive backoff.
//! - [`PendingQueue`] — Priority FIFO of tasks waiting for a free agent.

/// Assignment records and their state transitions.
pub mod assignment;
/// Completion callbacks and external status propagation.
pub mod callbacks;
/// Task-type and keyword capability inference.
pub mod capability;
/// Complexity classes used to scale execution timeouts.
pub mod complexity;
/// Orchestrator configuration.
pub mod config;
/// The orchestrator facade.
pub mod engine;
/// Broadcast fleet events.
pub mod events;
/// Heartbeat liveness sweep.
pub mod liveness;
/// Running executions and their results.
pub mod monitor;
/// Agent registry.
pub mod registry;
/// Agent selection strategies and scoring.
pub mod selector;
/// Pending task queue.
pub mod task_queue;
/// Shared orchestration types (Assignment, ExecutionResult, AgentStats, etc.).
pub mod types;

pub use assignment::{AgentAffinity, AssignmentBook};
pub use callbacks::{CompletionCallback, CompletionCallbacks, NoopPropagator, StatusPropagator};
pub use capability::{CapabilityMatcher, KeywordMatcher};
pub use complexity::Complexity;
pub use config::{OrchestratorConfig, SelectionStrategy};
pub use engine::{Orchestrator, OrchestratorBuilder, ResponseOutcome, TaskAssignment};
pub use events::{EventBus, EventRecord, FleetEvent};
pub use liveness::{adaptive_timeout, Ejection, LivenessMonitor, LivenessPolicy};
pub use monitor::{ExecutionRecord, ExecutionTracker};
pub use registry::{AgentHandle, AgentRegistry};
pub use selector::{performance_score, Candidate, Selection, SelectionReason, Selector};
pub use task_queue::{PendingEntry, PendingQueue, WorkItem};
pub use types::{
    AgentStats, Assignment, AssignmentContext, AssignmentStatus, ExecutionOptions,
    ExecutionResult, ExecutionStatus, TaskCompletion,
};
