use chrono::Utc;
use fleet_core::{Agent, AgentDescriptor, AgentStatus, FleetError, FleetResult};
use fleet_transport::{AgentDirectory, AgentEndpoint};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Shared handle to one agent's record.
pub type AgentHandle = Arc<Mutex<Agent>>;

/// Authoritative in-memory set of agents.
///
/// The map lock is only held for lookups; every mutation of a single agent
/// goes through that agent's own mutex.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentHandle>>,
    next_seq: AtomicU64,
}

impl AgentRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or overwrite an agent.
    ///
    /// Overwriting keeps the tasks the agent currently holds so capacity
    /// accounting stays exact across re-registration; a capacity below the
    /// held load is rejected.
    pub fn register(&self, descriptor: AgentDescriptor) -> FleetResult<Agent> {
        if descriptor.id.trim().is_empty() {
            return Err(FleetError::Validation("agent id must not be empty".into()));
        }
        if descriptor.capabilities.is_empty() {
            return Err(FleetError::Validation(format!(
                "agent '{}' must declare at least one capability",
                descriptor.id
            )));
        }
        if descriptor.max_concurrent_tasks == 0 {
            return Err(FleetError::Validation(format!(
                "agent '{}' must accept at least one concurrent task",
                descriptor.id
            )));
        }

        let mut agents = self.agents.write();
        if let Some(existing) = agents.get(&descriptor.id) {
            let mut agent = existing.lock();
            if agent.current_tasks.len() > descriptor.max_concurrent_tasks {
                return Err(FleetError::Validation(format!(
                    "agent '{}' holds {} tasks; max_concurrent_tasks cannot drop to {}",
                    descriptor.id,
                    agent.current_tasks.len(),
                    descriptor.max_concurrent_tasks
                )));
            }
            let held = std::mem::take(&mut agent.current_tasks);
            let seq = agent.registration_seq;
            let performance = agent.performance.clone();
            *agent = Agent::from_descriptor(descriptor, seq);
            agent.current_tasks = held;
            agent.performance = performance;
            agent.refresh_status();
            info!(agent_id = %agent.id, "Agent re-registered");
            return Ok(agent.clone());
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let agent = Agent::from_descriptor(descriptor, seq);
        info!(
            agent_id = %agent.id,
            transport = %agent.transport,
            max_tasks = agent.max_concurrent_tasks,
            "Agent registered"
        );
        agents.insert(agent.id.clone(), Arc::new(Mutex::new(agent.clone())));
        Ok(agent)
    }

    /// Remove an agent, returning its final record.
    pub fn unregister(&self, agent_id: &str) -> FleetResult<Agent> {
        let handle = self
            .agents
            .write()
            .remove(agent_id)
            .ok_or_else(|| FleetError::NotFound(format!("agent '{agent_id}' is not registered")))?;
        let agent = handle.lock().clone();
        info!(agent_id, held = agent.current_tasks.len(), "Agent unregistered");
        Ok(agent)
    }

    /// Record a heartbeat, optionally with a self-reported status.
    ///
    /// Clears the missed-heartbeat counter. An offline agent that heartbeats
    /// without a status comes back as available or busy.
    pub fn heartbeat(&self, agent_id: &str, status: Option<AgentStatus>) -> FleetResult<Agent> {
        let handle = self.handle(agent_id)?;
        let mut agent = handle.lock();
        agent.last_heartbeat = Utc::now();
        agent.missed_heartbeats = 0;
        match status {
            Some(AgentStatus::Offline) => agent.status = AgentStatus::Offline,
            Some(AgentStatus::Error) => agent.status = AgentStatus::Error,
            Some(AgentStatus::Available | AgentStatus::Busy) => {
                agent.status = AgentStatus::Available;
                agent.refresh_status();
            }
            None => {
                if agent.status == AgentStatus::Offline {
                    agent.status = AgentStatus::Available;
                }
                agent.refresh_status();
            }
        }
        debug!(agent_id, status = ?agent.status, "Heartbeat");
        Ok(agent.clone())
    }

    /// Snapshot of every agent in registration order.
    pub fn list(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self
            .agents
            .read()
            .values()
            .map(|h| h.lock().clone())
            .collect();
        agents.sort_by_key(|a| a.registration_seq);
        agents
    }

    /// Snapshot of one agent.
    pub fn get(&self, agent_id: &str) -> Option<Agent> {
        self.agents.read().get(agent_id).map(|h| h.lock().clone())
    }

    /// Handles for every agent, in registration order.
    pub fn handles(&self) -> Vec<AgentHandle> {
        let mut handles: Vec<(u64, AgentHandle)> = self
            .agents
            .read()
            .values()
            .map(|h| (h.lock().registration_seq, h.clone()))
            .collect();
        handles.sort_by_key(|(seq, _)| *seq);
        handles.into_iter().map(|(_, h)| h).collect()
    }

    /// Registered agent count.
    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    /// No agents registered.
    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Forget every agent.
    pub fn clear(&self) {
        self.agents.write().clear();
    }

    /// Claim a slot on `agent_id` for `task_id`.
    ///
    /// Succeeds only while the agent is available with spare capacity, so
    /// two concurrent selections of the same agent cannot both win.
    pub fn reserve(&self, agent_id: &str, task_id: &str) -> bool {
        let Ok(handle) = self.handle(agent_id) else {
            return false;
        };
        let mut agent = handle.lock();
        if !agent.is_eligible() || agent.holds_task(task_id) {
            return false;
        }
        agent.current_tasks.push(task_id.to_string());
        agent.refresh_status();
        true
    }

    /// Give back the slot `task_id` holds on `agent_id`.
    pub fn release(&self, agent_id: &str, task_id: &str) -> bool {
        let Ok(handle) = self.handle(agent_id) else {
            return false;
        };
        let mut agent = handle.lock();
        let before = agent.current_tasks.len();
        agent.current_tasks.retain(|t| t != task_id);
        let released = agent.current_tasks.len() != before;
        agent.refresh_status();
        released
    }

    /// Update the transport address (session or socket id) of an agent.
    pub fn set_address(&self, agent_id: &str, address: Option<String>) -> FleetResult<()> {
        let handle = self.handle(agent_id)?;
        handle.lock().address = address;
        Ok(())
    }

    /// Fold a successful completion into the agent's performance.
    pub fn record_completion(&self, agent_id: &str, duration_secs: f64) {
        if let Ok(handle) = self.handle(agent_id) {
            handle.lock().performance.record_success(duration_secs);
        }
    }

    /// Count a failure against the agent.
    pub fn record_failure(&self, agent_id: &str) {
        if let Ok(handle) = self.handle(agent_id) {
            handle.lock().performance.record_failure();
        }
    }

    fn handle(&self, agent_id: &str) -> FleetResult<AgentHandle> {
        self.agents
            .read()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| FleetError::NotFound(format!("agent '{agent_id}' is not registered")))
    }
}

impl AgentDirectory for AgentRegistry {
    fn endpoint(&self, agent_id: &str) -> Option<AgentEndpoint> {
        let handle = self.agents.read().get(agent_id).cloned()?;
        let agent = handle.lock();
        Some(AgentEndpoint {
            agent_id: agent.id.clone(),
            transport: agent.transport,
            address: agent.address.clone(),
            callback_secret: agent.callback_secret.clone(),
            status: agent.status,
            last_heartbeat: agent.last_heartbeat,
        })
    }
}
