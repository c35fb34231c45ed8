use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Something observable that happened in the fleet.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetEvent {
    /// An agent registered or re-registered.
    AgentRegistered {
        /// The agent.
        agent_id: String,
    },
    /// An agent was removed from the registry.
    AgentUnregistered {
        /// The agent.
        agent_id: String,
    },
    /// An agent went offline, by missed heartbeats or by its own report.
    AgentOffline {
        /// The agent.
        agent_id: String,
        /// Sweeps missed; zero when the agent reported itself offline.
        missed_heartbeats: u32,
    },
    /// A task was handed to an agent.
    TaskAssigned {
        /// The task.
        task_id: String,
        /// The assignee.
        agent_id: String,
        /// The new assignment.
        assignment_id: Uuid,
        /// Attempt number, starting at 1.
        attempt: u32,
    },
    /// No agent could take the task; it waits in the pending queue.
    TaskQueued {
        /// The task.
        task_id: String,
    },
    /// An agent reported work in progress.
    TaskProgress {
        /// The task.
        task_id: String,
        /// The reporting agent.
        agent_id: String,
        /// Reported percentage, if any.
        progress: Option<u8>,
    },
    /// An agent reported completion.
    TaskCompleted {
        /// The task.
        task_id: String,
        /// The agent that finished it.
        agent_id: String,
    },
    /// An attempt failed or timed out.
    TaskFailed {
        /// The task.
        task_id: String,
        /// The agent that held it.
        agent_id: String,
        /// Failure message.
        reason: String,
    },
    /// A task was taken back from an agent and queued again.
    TaskRequeued {
        /// The task.
        task_id: String,
        /// The agent it was taken from.
        agent_id: String,
    },
}

/// A [`FleetEvent`] with the time it was published.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    /// Publication time.
    pub at: DateTime<Utc>,
    /// What happened.
    #[serde(flatten)]
    pub event: FleetEvent,
}

/// Broadcast fan-out of fleet events. Publishing never blocks and never
/// fails; subscribers that fall behind lose the oldest events.
pub struct EventBus {
    tx: broadcast::Sender<EventRecord>,
}

impl EventBus {
    /// Bus holding up to `capacity` unread events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Stamp and broadcast an event.
    pub fn publish(&self, event: FleetEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(EventRecord {
            at: Utc::now(),
            event,
        });
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.tx.subscribe()
    }
}
