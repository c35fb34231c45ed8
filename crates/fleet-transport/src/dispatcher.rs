use crate::connection::ConnectionHub;
use crate::http_callback::HttpCallbackDelivery;
use crate::mailbox::Mailbox;
use crate::push::{QueueDelivery, SessionPush, SocketPush};
use crate::transport::{AgentDirectory, Delivery, DeliveryPlan, Envelope, StepMode};
use chrono::Utc;
use fleet_core::{FleetError, FleetResult, TransportKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum heartbeat age for an agent to count as reachable.
    pub liveness_window: Duration,
    /// Request timeout for HTTP callbacks.
    pub http_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            liveness_window: Duration::from_secs(90),
            http_timeout: Duration::from_secs(10),
        }
    }
}

/// Routes payloads to agents over their registered transport.
///
/// Every transport kind maps to a [`DeliveryPlan`]; the default plans all end
/// in the agent's mailbox so a failed live push degrades to polling instead
/// of failing the send.
pub struct Dispatcher {
    directory: Arc<dyn AgentDirectory>,
    mailbox: Arc<Mailbox>,
    sessions: Arc<ConnectionHub>,
    sockets: Arc<ConnectionHub>,
    plans: HashMap<TransportKind, DeliveryPlan>,
    config: DispatchConfig,
    closed: AtomicBool,
}

impl Dispatcher {
    /// Dispatcher resolving endpoints through `directory`.
    pub fn new(directory: Arc<dyn AgentDirectory>, config: DispatchConfig) -> Self {
        let mailbox = Arc::new(Mailbox::new());
        let sessions = ConnectionHub::new("session");
        let sockets = ConnectionHub::new("socket");

        let queue = Arc::new(QueueDelivery::new(mailbox.clone()));
        let http = Arc::new(HttpCallbackDelivery::new(config.http_timeout));

        let mut plans = HashMap::new();
        plans.insert(
            TransportKind::LocalQueue,
            DeliveryPlan::new().then(queue.clone(), StepMode::Required),
        );
        plans.insert(
            TransportKind::PushNotify,
            DeliveryPlan::new()
                .then(queue.clone(), StepMode::Required)
                .then(Arc::new(SessionPush::new(sessions.clone())), StepMode::BestEffort),
        );
        plans.insert(
            TransportKind::PersistentSocket,
            DeliveryPlan::new()
                .then(Arc::new(SocketPush::new(sockets.clone())), StepMode::Primary)
                .then(queue.clone(), StepMode::Fallback),
        );
        plans.insert(
            TransportKind::HttpCallback,
            DeliveryPlan::new()
                .then(http, StepMode::Primary)
                .then(queue, StepMode::Fallback),
        );

        Self {
            directory,
            mailbox,
            sessions,
            sockets,
            plans,
            config,
            closed: AtomicBool::new(false),
        }
    }

    /// Replace the delivery plan used for one transport kind.
    pub fn with_plan(mut self, kind: TransportKind, plan: DeliveryPlan) -> Self {
        self.plans.insert(kind, plan);
        self
    }

    /// Deliver `payload` to `agent_id`.
    ///
    /// Only an unknown agent, a closed dispatcher, or a plan in which every
    /// step failed yields [`Delivery::Failed`].
    pub async fn send(&self, agent_id: &str, payload: &str) -> Delivery {
        if self.closed.load(Ordering::SeqCst) {
            return Delivery::Failed("dispatcher is closed".into());
        }
        let Some(endpoint) = self.directory.endpoint(agent_id) else {
            return Delivery::Failed(format!("agent '{agent_id}' is not registered"));
        };
        let Some(plan) = self.plans.get(&endpoint.transport) else {
            return Delivery::Failed(format!("no delivery plan for {}", endpoint.transport));
        };

        let envelope = Envelope::new(agent_id, payload);
        let outcome = plan.run(&endpoint, &envelope).await;
        match &outcome {
            Delivery::Delivered(via) => {
                info!(agent_id, delivery_id = %envelope.id, via, "Payload delivered");
            }
            Delivery::Queued => {
                debug!(agent_id, delivery_id = %envelope.id, transport = %endpoint.transport, "Payload queued");
            }
            Delivery::Failed(reason) => {
                warn!(agent_id, reason = %reason, "Delivery failed");
            }
        }
        outcome
    }

    /// Wait up to `timeout` for the next raw response from `agent_id`.
    pub async fn receive(&self, agent_id: &str, timeout: Duration) -> FleetResult<String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FleetError::Transport("dispatcher is closed".into()));
        }
        self.mailbox.next_response(agent_id, timeout).await
    }

    /// Whether `agent_id` can currently be reached over its transport.
    pub fn is_reachable(&self, agent_id: &str) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let Some(endpoint) = self.directory.endpoint(agent_id) else {
            return false;
        };
        if !endpoint.status.is_online() {
            return false;
        }
        let age = Utc::now()
            .signed_duration_since(endpoint.last_heartbeat)
            .to_std()
            .unwrap_or_default();
        if age >= self.config.liveness_window {
            return false;
        }

        match endpoint.transport {
            TransportKind::LocalQueue | TransportKind::PushNotify => true,
            TransportKind::PersistentSocket => {
                let address = endpoint.address.as_deref().unwrap_or(agent_id);
                self.sockets.is_open(address)
            }
            TransportKind::HttpCallback => endpoint
                .address
                .as_deref()
                .is_some_and(|a| !a.trim().is_empty()),
        }
    }

    /// Agent-side poll: take up to `limit` queued envelopes.
    pub fn fetch(&self, agent_id: &str, limit: usize) -> Vec<Envelope> {
        self.mailbox.fetch(agent_id, limit)
    }

    /// Agent-side reply: store a raw response for the monitor to receive.
    pub fn submit_response(&self, agent_id: &str, raw: impl Into<String>) {
        self.mailbox.push_response(agent_id, raw);
    }

    /// Envelopes waiting in the agent's mailbox.
    pub fn pending_count(&self, agent_id: &str) -> usize {
        self.mailbox.pending(agent_id)
    }

    /// Drop an agent's queued payloads and wake any pending receivers.
    pub fn close_mailbox(&self, agent_id: &str) -> usize {
        self.mailbox.clear(agent_id)
    }

    /// Hub of SSE sessions.
    pub fn sessions(&self) -> &Arc<ConnectionHub> {
        &self.sessions
    }

    /// Hub of WebSocket connections.
    pub fn sockets(&self) -> &Arc<ConnectionHub> {
        &self.sockets
    }

    /// Whether `close` has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting sends and drop all open connections.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sessions.close_all();
        self.sockets.close_all();
        info!("Dispatcher closed");
    }
}
