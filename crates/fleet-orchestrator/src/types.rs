use chrono::{DateTime, Utc};
use fleet_core::{ErrorKind, TaskPriority};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle state of one assignment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    /// Delivered, no response yet.
    Assigned,
    /// Agent reported progress.
    InProgress,
    /// Agent reported completion.
    Completed,
    /// Agent reported failure.
    Failed,
    /// No answer before the deadline.
    Timeout,
}

impl AssignmentStatus {
    /// Whether this attempt has ended. Failed and timed-out attempts may
    /// still be retried until the assignment is closed.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AssignmentStatus::Completed | AssignmentStatus::Failed | AssignmentStatus::Timeout
        )
    }

    /// Forward transitions of a single attempt. Retries are not covered here.
    pub fn can_transition_to(self, next: AssignmentStatus) -> bool {
        use AssignmentStatus::*;
        matches!(
            (self, next),
            (Assigned, InProgress | Completed | Failed | Timeout)
                | (InProgress, InProgress | Completed | Failed | Timeout)
        )
    }
}

impl std::fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AssignmentStatus::Assigned => "assigned",
            AssignmentStatus::InProgress => "in_progress",
            AssignmentStatus::Completed => "completed",
            AssignmentStatus::Failed => "failed",
            AssignmentStatus::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Project placement of the assigned task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssignmentContext {
    /// Owning project.
    pub project_id: String,
    /// Owning epic.
    pub epic_id: Option<String>,
    /// Ids of tasks this one depends on.
    pub dependencies: Vec<String>,
}

/// Binds one task attempt to one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    /// Assignment id.
    pub id: Uuid,
    /// Assigned task.
    pub task_id: String,
    /// Assignee.
    pub agent_id: String,
    /// Lifecycle state.
    pub status: AssignmentStatus,
    /// When the attempt started.
    pub assigned_at: DateTime<Utc>,
    /// Deadline derived from the estimate.
    pub expected_completion_at: DateTime<Utc>,
    /// Last status transition.
    pub last_status_update: DateTime<Utc>,
    /// Attempt number, starting at 1.
    pub attempts: u32,
    /// Task priority at assignment time.
    pub priority: TaskPriority,
    /// Estimate the deadline was derived from.
    pub estimated_duration_secs: u64,
    /// Project placement.
    pub context: AssignmentContext,
    /// Closed assignments accept no further transitions.
    pub closed: bool,
    /// Last reported failure.
    pub last_error: Option<String>,
    /// Last reported progress percentage.
    pub progress: Option<u8>,
    /// Completion details or failure reason recorded at close.
    pub details: Option<String>,
    /// Closed without an outcome so the task could go back to the queue.
    pub requeued: bool,
}

impl Assignment {
    /// Not yet closed; at most one per task id.
    pub fn is_active(&self) -> bool {
        !self.closed
    }
}

/// State of one `execute_task` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Waiting for a free agent.
    Queued,
    /// Assigned and being monitored.
    InProgress,
    /// Agent reported completion.
    Completed,
    /// Failed with no retry left.
    Failed,
    /// Deadline passed.
    Timeout,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::InProgress => "in_progress",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Per-call overrides for `execute_task`.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Monitor deadline; defaults to the complexity-scaled base timeout.
    pub timeout: Option<Duration>,
    /// Response poll period; defaults to the configured poll interval.
    pub poll_interval: Option<Duration>,
    /// Epic title shown in the payload.
    pub epic_title: Option<String>,
}

impl ExecutionOptions {
    /// Override the monitor deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the poll period.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Set the epic title.
    pub fn with_epic_title(mut self, title: impl Into<String>) -> Self {
        self.epic_title = Some(title.into());
        self
    }
}

/// Final outcome of one `execute_task` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Id of the `execute_task` call.
    pub execution_id: Uuid,
    /// Task executed.
    pub task_id: String,
    /// Agent of the last attempt.
    pub agent_id: Option<String>,
    /// Assignment of the last attempt.
    pub assignment_id: Option<Uuid>,
    /// Whether the task completed.
    pub success: bool,
    /// Terminal status.
    pub status: ExecutionStatus,
    /// Attempts made.
    pub attempts: u32,
    /// Failure message.
    pub error: Option<String>,
    /// Failure category.
    pub error_kind: Option<ErrorKind>,
    /// Completion details.
    pub details: Option<String>,
    /// Wall time of the whole call.
    pub duration_ms: u64,
    /// When the call ended.
    pub finished_at: DateTime<Utc>,
}

/// What a completion callback learns about a finished task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompletion {
    /// Finished task.
    pub task_id: String,
    /// Whether it completed.
    pub success: bool,
    /// Completion details or failure reason.
    pub details: Option<String>,
}

/// Fleet-wide counters for the administrative surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    /// Registered agents.
    pub total_agents: usize,
    /// Agents with free capacity.
    pub available_agents: usize,
    /// Agents at capacity.
    pub busy_agents: usize,
    /// Unreachable agents.
    pub offline_agents: usize,
    /// Agents reporting a fault.
    pub error_agents: usize,
    /// Sum of concurrent task limits.
    pub total_capacity: usize,
    /// Tasks currently held by agents.
    pub tasks_in_flight: usize,
    /// Tasks waiting for an agent.
    pub pending_tasks: usize,
    /// Open assignments.
    pub active_assignments: usize,
    /// Running `execute_task` calls.
    pub active_executions: usize,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!AssignmentStatus::Assigned.is_terminal());
        assert!(!AssignmentStatus::InProgress.is_terminal());
        assert!(AssignmentStatus::Completed.is_terminal());
        assert!(AssignmentStatus::Failed.is_terminal());
        assert!(AssignmentStatus::Timeout.is_terminal());
    }

    #[test]
    fn test_transitions() {
        use AssignmentStatus::*;
        assert!(Assigned.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Timeout.can_transition_to(Assigned));
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&AssignmentStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        assert_eq!(ExecutionStatus::Queued.to_string(), "queued");
    }
}
