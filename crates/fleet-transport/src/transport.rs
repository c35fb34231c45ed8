use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::{AgentStatus, TransportKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Everything the dispatcher needs to know about an agent to reach it.
#[derive(Debug, Clone)]
pub struct AgentEndpoint {
    /// Agent id.
    pub agent_id: String,
    /// Transport kind.
    pub transport: TransportKind,
    /// Session id, socket id or callback URL.
    pub address: Option<String>,
    /// HMAC key for HTTP callbacks.
    pub callback_secret: Option<String>,
    /// Registry status.
    pub status: AgentStatus,
    /// Last heartbeat.
    pub last_heartbeat: DateTime<Utc>,
}

/// Source of agent endpoints. Implemented by the agent registry.
pub trait AgentDirectory: Send + Sync {
    /// Current endpoint, or `None` if the agent is unknown.
    fn endpoint(&self, agent_id: &str) -> Option<AgentEndpoint>;
}

/// A task payload addressed to one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Envelope id.
    pub id: Uuid,
    /// Recipient.
    pub agent_id: String,
    /// Rendered task instructions.
    pub payload: String,
    /// Enqueue time.
    pub enqueued_at: DateTime<Utc>,
}

impl Envelope {
    /// Fresh envelope stamped now.
    pub fn new(agent_id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            payload: payload.into(),
            enqueued_at: Utc::now(),
        }
    }
}

/// Outcome of one delivery strategy, or of a whole plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Actively pushed to the agent by the named strategy.
    Delivered(&'static str),
    /// Durably queued for the agent to poll.
    Queued,
    /// Could not be delivered or queued.
    Failed(String),
}

impl Delivery {
    /// Delivered or queued.
    pub fn is_success(&self) -> bool {
        !matches!(self, Delivery::Failed(_))
    }
}

/// One way of getting an envelope to an agent.
#[async_trait]
pub trait DeliveryStrategy: Send + Sync {
    /// Label used in logs and `Delivery::Delivered`.
    fn name(&self) -> &'static str;
    /// Try to hand the envelope over.
    async fn deliver(&self, endpoint: &AgentEndpoint, envelope: &Envelope) -> Delivery;
}

/// How a plan step's failure affects the overall outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    /// Failure fails the whole send.
    Required,
    /// Tried first; failure moves on to the next step.
    Primary,
    /// Failure is logged and ignored.
    BestEffort,
    /// Only runs when nothing earlier succeeded.
    Fallback,
}

/// A strategy plus its role in a plan.
#[derive(Clone)]
pub struct PlanStep {
    /// The strategy to run.
    pub strategy: Arc<dyn DeliveryStrategy>,
    /// Its role in the plan.
    pub mode: StepMode,
}

/// Ordered delivery strategies for one transport kind.
#[derive(Clone, Default)]
pub struct DeliveryPlan {
    steps: Vec<PlanStep>,
}

impl DeliveryPlan {
    /// Empty plan.
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Append a step.
    pub fn then(mut self, strategy: Arc<dyn DeliveryStrategy>, mode: StepMode) -> Self {
        self.steps.push(PlanStep { strategy, mode });
        self
    }

    /// Steps in order.
    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    /// Run every step in order and fold their outcomes.
    ///
    /// `Delivered` beats `Queued`; only a failing `Required` step, or a plan
    /// in which no step succeeded, yields `Failed`.
    pub async fn run(&self, endpoint: &AgentEndpoint, envelope: &Envelope) -> Delivery {
        let mut outcome: Option<Delivery> = None;
        let mut last_failure = String::from("no delivery strategy configured");

        for step in &self.steps {
            if step.mode == StepMode::Fallback && outcome.is_some() {
                continue;
            }
            match step.strategy.deliver(endpoint, envelope).await {
                Delivery::Delivered(via) => outcome = Some(Delivery::Delivered(via)),
                Delivery::Queued => {
                    if outcome.is_none() {
                        outcome = Some(Delivery::Queued);
                    }
                }
                Delivery::Failed(reason) => {
                    if step.mode == StepMode::Required {
                        return Delivery::Failed(reason);
                    }
                    tracing::debug!(
                        agent_id = %endpoint.agent_id,
                        strategy = step.strategy.name(),
                        reason = %reason,
                        "Delivery step failed, continuing"
                    );
                    last_failure = reason;
                }
            }
        }

        outcome.unwrap_or(Delivery::Failed(last_failure))
    }
}
