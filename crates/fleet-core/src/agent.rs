use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// What kind of work an agent can take on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// UI and client-side work.
    Frontend,
    /// Server-side services and APIs.
    Backend,
    /// Schemas, migrations and queries.
    Database,
    /// Writing and running tests.
    Testing,
    /// Build, deploy and infrastructure.
    Devops,
    /// Docs and guides.
    Documentation,
    /// Restructuring without behaviour change.
    Refactoring,
    /// Tracking down defects.
    Debugging,
    /// Catch-all; matches general tasks.
    General,
}

impl Capability {
    /// Every capability, in declaration order.
    pub const ALL: [Capability; 9] = [
        Capability::Frontend,
        Capability::Backend,
        Capability::Database,
        Capability::Testing,
        Capability::Devops,
        Capability::Documentation,
        Capability::Refactoring,
        Capability::Debugging,
        Capability::General,
    ];

    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Frontend => "frontend",
            Capability::Backend => "backend",
            Capability::Database => "database",
            Capability::Testing => "testing",
            Capability::Devops => "devops",
            Capability::Documentation => "documentation",
            Capability::Refactoring => "refactoring",
            Capability::Debugging => "debugging",
            Capability::General => "general",
        }
    }

    /// Parse a capability name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.trim().to_lowercase();
        Self::ALL.iter().copied().find(|c| c.as_str() == lower)
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness and load status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Online with free capacity.
    Available,
    /// Online and at capacity.
    Busy,
    /// Not reachable; receives no work.
    Offline,
    /// Reported a fault; receives no work.
    Error,
}

impl AgentStatus {
    /// `available` and `busy` agents count as online.
    pub fn is_online(&self) -> bool {
        matches!(self, AgentStatus::Available | AgentStatus::Busy)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Available => write!(f, "available"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Offline => write!(f, "offline"),
            AgentStatus::Error => write!(f, "error"),
        }
    }
}

/// Wire transport an agent is reachable over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Payloads wait in a mailbox until the agent polls.
    #[default]
    LocalQueue,
    /// Mailbox plus an immediate push to an open session.
    PushNotify,
    /// Direct push over a long-lived socket.
    PersistentSocket,
    /// HTTP POST to a callback URL registered by the agent.
    HttpCallback,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::LocalQueue => write!(f, "local-queue"),
            TransportKind::PushNotify => write!(f, "push-notify"),
            TransportKind::PersistentSocket => write!(f, "persistent-socket"),
            TransportKind::HttpCallback => write!(f, "http-callback"),
        }
    }
}

/// Rolling performance figures used by the selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPerformance {
    /// Tasks finished successfully.
    pub tasks_completed: u64,
    /// Tasks that failed or timed out.
    pub tasks_failed: u64,
    /// Mean completion time in seconds over completed tasks.
    pub average_completion_secs: f64,
    /// Fraction of finished tasks that succeeded, in `[0, 1]`.
    pub success_rate: f64,
    /// When the last successful task finished.
    pub last_task_completed_at: Option<DateTime<Utc>>,
}

impl Default for AgentPerformance {
    fn default() -> Self {
        Self {
            tasks_completed: 0,
            tasks_failed: 0,
            average_completion_secs: 0.0,
            success_rate: 1.0,
            last_task_completed_at: None,
        }
    }
}

impl AgentPerformance {
    /// Whether any task has finished on this agent yet.
    pub fn has_history(&self) -> bool {
        self.tasks_completed + self.tasks_failed > 0
    }

    /// Fold a successful completion into the running figures.
    pub fn record_success(&mut self, duration_secs: f64) {
        let n = self.tasks_completed as f64;
        self.average_completion_secs =
            (self.average_completion_secs * n + duration_secs.max(0.0)) / (n + 1.0);
        self.tasks_completed += 1;
        self.last_task_completed_at = Some(Utc::now());
        self.recompute_rate();
    }

    /// Count a failure and recompute the success rate.
    pub fn record_failure(&mut self) {
        self.tasks_failed += 1;
        self.recompute_rate();
    }

    fn recompute_rate(&mut self) {
        let total = self.tasks_completed + self.tasks_failed;
        if total > 0 {
            self.success_rate = self.tasks_completed as f64 / total as f64;
        }
    }
}

/// Registration request for a new agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Unique agent id.
    pub id: String,
    /// Declared capabilities.
    pub capabilities: Vec<Capability>,
    /// Concurrent task limit; must be at least 1.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// How tasks reach the agent.
    #[serde(default)]
    pub transport: TransportKind,
    /// Session id, socket id or callback URL depending on `transport`.
    #[serde(default)]
    pub address: Option<String>,
    /// Shared secret used to sign HTTP callback deliveries.
    #[serde(default)]
    pub callback_secret: Option<String>,
    /// Opaque agent metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_max_concurrent_tasks() -> usize {
    1
}

impl AgentDescriptor {
    /// Descriptor with default capacity and the mailbox transport.
    pub fn new(id: impl Into<String>, capabilities: Vec<Capability>) -> Self {
        Self {
            id: id.into(),
            capabilities,
            max_concurrent_tasks: default_max_concurrent_tasks(),
            transport: TransportKind::LocalQueue,
            address: None,
            callback_secret: None,
            metadata: HashMap::new(),
        }
    }

    /// Set the concurrent task limit.
    pub fn with_max_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    /// Set the transport and its address.
    pub fn with_transport(mut self, transport: TransportKind, address: Option<String>) -> Self {
        self.transport = transport;
        self.address = address;
        self
    }

    /// Set the callback signing secret.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.callback_secret = Some(secret.into());
        self
    }
}

/// A registered agent together with its live accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique agent id.
    pub id: String,
    /// Declared capabilities.
    pub capabilities: BTreeSet<Capability>,
    /// Concurrent task limit.
    pub max_concurrent_tasks: usize,
    /// Task ids in assignment order.
    pub current_tasks: Vec<String>,
    /// Current availability.
    pub status: AgentStatus,
    /// Last heartbeat received.
    pub last_heartbeat: DateTime<Utc>,
    /// Selector inputs.
    pub performance: AgentPerformance,
    /// How tasks reach the agent.
    pub transport: TransportKind,
    /// Transport address, if any.
    pub address: Option<String>,
    /// HTTP callback signing secret. Never serialized.
    #[serde(skip_serializing)]
    pub callback_secret: Option<String>,
    /// First registration time.
    pub registered_at: DateTime<Utc>,
    /// Monotonic registration counter; lower registered earlier.
    pub registration_seq: u64,
    /// Consecutive liveness sweeps that found this agent silent.
    pub missed_heartbeats: u32,
    /// Opaque agent metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Agent {
    /// Build a fresh agent record from a registration request.
    pub fn from_descriptor(descriptor: AgentDescriptor, registration_seq: u64) -> Self {
        let now = Utc::now();
        Self {
            id: descriptor.id,
            capabilities: descriptor.capabilities.into_iter().collect(),
            max_concurrent_tasks: descriptor.max_concurrent_tasks,
            current_tasks: Vec::new(),
            status: AgentStatus::Available,
            last_heartbeat: now,
            performance: AgentPerformance::default(),
            transport: descriptor.transport,
            address: descriptor.address,
            callback_secret: descriptor.callback_secret,
            registered_at: now,
            registration_seq,
            missed_heartbeats: 0,
            metadata: descriptor.metadata,
        }
    }

    /// Fraction of capacity in use, in `[0, 1]`.
    pub fn load_ratio(&self) -> f64 {
        if self.max_concurrent_tasks == 0 {
            return 1.0;
        }
        (self.current_tasks.len() as f64 / self.max_concurrent_tasks as f64).min(1.0)
    }

    /// Online and below its concurrent task limit.
    pub fn has_capacity(&self) -> bool {
        self.current_tasks.len() < self.max_concurrent_tasks
    }

    /// Available with room for one more task.
    pub fn is_eligible(&self) -> bool {
        self.status == AgentStatus::Available && self.has_capacity()
    }

    /// Whether the agent declared `capability`.
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Whether `task_id` is among the agent's current tasks.
    pub fn holds_task(&self, task_id: &str) -> bool {
        self.current_tasks.iter().any(|t| t == task_id)
    }

    /// Recompute `available`/`busy` from the task count.
    ///
    /// Offline and error agents keep their status; only a heartbeat or an
    /// explicit status update brings them back.
    pub fn refresh_status(&mut self) {
        if !self.status.is_online() {
            return;
        }
        self.status = if self.has_capacity() {
            AgentStatus::Available
        } else {
            AgentStatus::Busy
        };
    }

    /// Seconds since the last heartbeat as seen from `now`.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_heartbeat
    }
}
