use crate::assignment::AssignmentBook;
use crate::callbacks::{CompletionCallbacks, NoopPropagator, StatusPropagator};
use crate::capability::{CapabilityMatcher, KeywordMatcher};
use crate::complexity::Complexity;
use crate::config::OrchestratorConfig;
use crate::events::{EventBus, EventRecord, FleetEvent};
use crate::liveness::{Ejection, LivenessMonitor, LivenessPolicy};
use crate::monitor::{ExecutionRecord, ExecutionTracker};
use crate::registry::AgentRegistry;
use crate::selector::{Candidate, Selector};
use crate::task_queue::{PendingEntry, PendingQueue, WorkItem};
use crate::types::{
    AgentStats, Assignment, AssignmentStatus, ExecutionOptions, ExecutionResult, ExecutionStatus,
    TaskCompletion,
};
use chrono::{DateTime, Utc};
use fleet_core::{
    Agent, AgentDescriptor, AgentResponse, AgentStatus, ErrorKind, FleetError, FleetResult,
    ProjectContext, ResponseStatus, SentinelProtocol, Task, TextSentinel, TransportKind,
};
use fleet_transport::{AgentDirectory, Delivery, DispatchConfig, Dispatcher, Envelope};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// An assignment together with the payload its agent should receive.
#[derive(Debug, Clone)]
pub struct TaskAssignment {
    /// The open assignment.
    pub assignment: Assignment,
    /// Rendered task instructions.
    pub payload: String,
}

/// What an agent response did to its assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseOutcome {
    /// No open assignment for the task, or the wrong agent answered.
    Ignored,
    /// Progress recorded.
    Progress,
    /// Assignment closed as completed.
    Completed,
    /// Assignment closed as failed with no retry left.
    Failed,
    /// Failed and redelivered to a freshly selected agent.
    Retried,
    /// Failed with no agent free for another attempt; back in the queue.
    Requeued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseSource {
    /// Picked up by an `execute_task` monitor.
    Monitor,
    /// Pushed by the agent through the gateway.
    Push,
}

enum RetryOutcome {
    Redelivered(Assignment),
    Requeued,
    Closed,
}

/// Builder for [`Orchestrator`] with swappable collaborators.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    matcher: Arc<dyn CapabilityMatcher>,
    protocol: Arc<dyn SentinelProtocol>,
    propagator: Arc<dyn StatusPropagator>,
}

impl OrchestratorBuilder {
    /// Replace the capability matcher.
    pub fn with_matcher(mut self, matcher: Arc<dyn CapabilityMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    /// Replace the response protocol.
    pub fn with_protocol(mut self, protocol: Arc<dyn SentinelProtocol>) -> Self {
        self.protocol = protocol;
        self
    }

    /// Replace the external status propagator.
    pub fn with_propagator(mut self, propagator: Arc<dyn StatusPropagator>) -> Self {
        self.propagator = propagator;
        self
    }

    /// Validate the configuration and assemble the orchestrator.
    pub fn build(self) -> FleetResult<Arc<Orchestrator>> {
        self.config.validate()?;

        let registry = Arc::new(AgentRegistry::new());
        let directory: Arc<dyn AgentDirectory> = registry.clone();
        let dispatcher = Arc::new(Dispatcher::new(
            directory,
            DispatchConfig {
                liveness_window: self.config.liveness_window(),
                http_timeout: self.config.http_callback_timeout(),
            },
        ));
        let liveness = LivenessMonitor::new(LivenessPolicy {
            interval: self.config.heartbeat_interval(),
            tolerance_multiplier: self.config.tolerance_multiplier,
            max_missed: self.config.max_missed_heartbeats,
        });

        info!(
            strategy = %self.config.selection_strategy,
            max_retries = self.config.max_retries,
            heartbeat_secs = self.config.heartbeat_interval_secs,
            "Orchestrator created"
        );

        Ok(Arc::new(Orchestrator {
            selector: Selector::new(self.config.selection_strategy, self.matcher),
            executions: ExecutionTracker::new(self.config.result_retention()),
            events: EventBus::new(self.config.event_buffer),
            protocol: self.protocol,
            propagator: self.propagator,
            registry,
            dispatcher,
            liveness,
            queue: PendingQueue::new(),
            book: AssignmentBook::new(),
            callbacks: CompletionCallbacks::new(),
            drain_gate: tokio::sync::Mutex::new(()),
            background: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
            config: self.config,
        }))
    }
}

/// Task-to-agent dispatch core.
///
/// Owns the agent registry, the pending queue and every assignment. Tasks are
/// matched to agents, delivered over the agent's transport and monitored
/// until they complete, fail, time out or go back to the queue.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<AgentRegistry>,
    dispatcher: Arc<Dispatcher>,
    selector: Selector,
    protocol: Arc<dyn SentinelProtocol>,
    propagator: Arc<dyn StatusPropagator>,
    queue: PendingQueue,
    book: AssignmentBook,
    executions: ExecutionTracker,
    callbacks: CompletionCallbacks,
    liveness: LivenessMonitor,
    events: EventBus,
    // Serializes queue drains so two sweeps never race for the same entry.
    drain_gate: tokio::sync::Mutex<()>,
    background: Mutex<Vec<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl Orchestrator {
    /// Start building an orchestrator.
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            matcher: Arc::new(KeywordMatcher),
            protocol: Arc::new(TextSentinel::new()),
            propagator: Arc::new(NoopPropagator),
        }
    }

    /// Create an orchestrator with the default matcher, codec and propagator.
    pub fn new(config: OrchestratorConfig) -> FleetResult<Arc<Self>> {
        Self::builder(config).build()
    }

    /// Active configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// The agent registry.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// The transport dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Whether `destroy` has run.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Spawn the liveness sweep and the queue drain loops.
    ///
    /// The loops hold only a weak reference and stop once the orchestrator
    /// is dropped or destroyed. Calling this twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut background = self.background.lock();
        if !background.is_empty() || self.is_destroyed() {
            return;
        }

        let weak = Arc::downgrade(self);
        let period = self.config.heartbeat_interval();
        background.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(orchestrator) = weak.upgrade() else {
                    break;
                };
                orchestrator.sweep_liveness().await;
            }
        }));

        let weak = Arc::downgrade(self);
        let period = self.config.queue_drain_interval();
        background.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(orchestrator) = weak.upgrade() else {
                    break;
                };
                orchestrator.drain_queue().await;
            }
        }));

        info!("Orchestrator background loops started");
    }

    /// Stop the background loops, close every transport and drop all state.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
        self.dispatcher.close();
        self.executions.clear();
        self.queue.clear();
        self.book.clear();
        self.callbacks.clear();
        self.registry.clear();
        info!("Orchestrator destroyed");
    }

    // ------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------

    /// Register (or overwrite) an agent and hand it any queued work.
    pub async fn register_agent(&self, descriptor: AgentDescriptor) -> FleetResult<Agent> {
        self.ensure_running()?;
        let agent = self.registry.register(descriptor)?;
        self.events.publish(FleetEvent::AgentRegistered {
            agent_id: agent.id.clone(),
        });
        self.propagate_agent(&agent.id, agent.status, "registration");
        self.drain_queue().await;
        Ok(agent)
    }

    /// Remove an agent. Its open assignments go back to the pending queue.
    pub async fn unregister_agent(&self, agent_id: &str) -> FleetResult<Agent> {
        self.ensure_running()?;
        let agent = self.registry.unregister(agent_id)?;

        let requeued = self
            .book
            .open_for_agent(agent_id)
            .iter()
            .filter(|a| self.requeue_assignment(a.id))
            .count();
        let dropped = self.dispatcher.close_mailbox(agent_id);
        let address = agent.address.as_deref().unwrap_or(agent_id);
        self.dispatcher.sessions().detach(address);
        self.dispatcher.sockets().detach(address);

        info!(agent_id, requeued, dropped, "Agent left the fleet");
        self.events.publish(FleetEvent::AgentUnregistered {
            agent_id: agent_id.to_string(),
        });
        self.propagate_agent(agent_id, AgentStatus::Offline, "unregistration");
        self.drain_queue().await;
        Ok(agent)
    }

    /// Record a heartbeat. An agent that becomes available picks up queued
    /// work; one that reports itself offline or in error gives its open
    /// assignments back to the pending queue.
    pub async fn heartbeat(&self, agent_id: &str, status: Option<AgentStatus>) -> FleetResult<Agent> {
        self.ensure_running()?;
        let before = self.registry.get(agent_id).map(|a| a.status);
        let agent = self.registry.heartbeat(agent_id, status)?;
        let changed = before != Some(agent.status);
        if changed {
            self.propagate_agent(agent_id, agent.status, "heartbeat");
        }

        if !agent.status.is_online() {
            let requeued = self
                .book
                .open_for_agent(agent_id)
                .iter()
                .filter(|a| self.requeue_assignment(a.id))
                .count();
            if requeued > 0 {
                warn!(agent_id, status = ?agent.status, requeued, "Agent stepped down, work requeued");
            }
            if changed && agent.status == AgentStatus::Offline {
                self.events.publish(FleetEvent::AgentOffline {
                    agent_id: agent_id.to_string(),
                    missed_heartbeats: 0,
                });
            }
            if requeued > 0 {
                self.drain_queue().await;
            }
            return Ok(self.registry.get(agent_id).unwrap_or(agent));
        }

        if changed && agent.is_eligible() {
            self.drain_queue().await;
        }
        Ok(agent)
    }

    /// Snapshot of every registered agent.
    pub fn agents(&self) -> Vec<Agent> {
        self.registry.list()
    }

    /// Snapshot of one agent.
    pub fn agent(&self, agent_id: &str) -> Option<Agent> {
        self.registry.get(agent_id)
    }

    /// Attach a live connection for a push-notify or persistent-socket agent.
    ///
    /// Returns the address the connection was registered under.
    pub fn attach_connection(
        &self,
        agent_id: &str,
        tx: mpsc::UnboundedSender<String>,
    ) -> FleetResult<String> {
        self.ensure_running()?;
        let agent = self
            .registry
            .get(agent_id)
            .ok_or_else(|| FleetError::NotFound(format!("agent '{agent_id}' is not registered")))?;
        let address = agent.address.clone().unwrap_or_else(|| agent_id.to_string());
        match agent.transport {
            TransportKind::PushNotify => self.dispatcher.sessions().attach(address.clone(), tx),
            TransportKind::PersistentSocket => self.dispatcher.sockets().attach(address.clone(), tx),
            other => {
                return Err(FleetError::Validation(format!(
                    "agent '{agent_id}' uses the {other} transport, which takes no live connection"
                )))
            }
        }
        if agent.address.is_none() {
            self.registry.set_address(agent_id, Some(address.clone()))?;
        }
        Ok(address)
    }

    /// Forget a closed session or socket.
    pub fn detach_connection(&self, agent_id: &str, address: &str) {
        self.dispatcher.sessions().detach(address);
        self.dispatcher.sockets().detach(address);
        debug!(agent_id, address, "Connection detached");
    }

    /// Agent-side poll of queued task payloads.
    pub fn fetch_tasks(&self, agent_id: &str, limit: usize) -> FleetResult<Vec<Envelope>> {
        if self.registry.get(agent_id).is_none() {
            return Err(FleetError::NotFound(format!(
                "agent '{agent_id}' is not registered"
            )));
        }
        Ok(self.dispatcher.fetch(agent_id, limit))
    }

    /// Hand a raw response to whichever monitor is polling this agent.
    pub fn submit_response(&self, agent_id: &str, raw: impl Into<String>) -> FleetResult<()> {
        if self.registry.get(agent_id).is_none() {
            return Err(FleetError::NotFound(format!(
                "agent '{agent_id}' is not registered"
            )));
        }
        self.dispatcher.submit_response(agent_id, raw);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Assignment
    // ------------------------------------------------------------------

    /// Select an agent for `task` and open its assignment.
    ///
    /// Returns `None` when every agent is busy; the task then waits in the
    /// pending queue. The payload is not sent; see [`Self::dispatch_task`].
    pub fn assign_task(
        &self,
        task: Task,
        context: ProjectContext,
        epic_title: Option<String>,
    ) -> FleetResult<Option<TaskAssignment>> {
        let timeout = self.default_timeout(&task);
        self.assign_work(WorkItem::new(task, context, epic_title), timeout)
    }

    /// Assign and deliver without waiting for the outcome. Responses must be
    /// pushed through [`Self::process_agent_response`].
    pub async fn dispatch_task(
        &self,
        task: Task,
        context: ProjectContext,
        epic_title: Option<String>,
    ) -> FleetResult<Option<Assignment>> {
        let Some(ticket) = self.assign_task(task, context, epic_title)? else {
            return Ok(None);
        };
        self.deliver(&ticket).await?;
        Ok(Some(ticket.assignment))
    }

    fn assign_work(&self, work: WorkItem, timeout: Duration) -> FleetResult<Option<TaskAssignment>> {
        self.ensure_running()?;
        work.task.validate()?;
        if let Some(open) = self.book.open_for_task(work.task_id()) {
            return Err(FleetError::Validation(format!(
                "task '{}' is already assigned to agent '{}' (attempt {})",
                open.task_id, open.agent_id, open.attempts
            )));
        }

        match self.open_assignment(&work, timeout)? {
            Some(ticket) => {
                self.queue.remove(work.task_id());
                Ok(Some(ticket))
            }
            None => {
                let task_id = work.task_id().to_string();
                if self.queue.push(work) {
                    info!(task_id = %task_id, pending = self.queue.len(), "No eligible agent, task queued");
                    self.events.publish(FleetEvent::TaskQueued { task_id });
                }
                Ok(None)
            }
        }
    }

    fn open_assignment(&self, work: &WorkItem, timeout: Duration) -> FleetResult<Option<TaskAssignment>> {
        let Some(agent_id) = self.select_and_reserve(work)? else {
            return Ok(None);
        };
        let assignment = match self.book.open(work.clone(), &agent_id, timeout) {
            Ok(a) => a,
            Err(e) => {
                self.registry.release(&agent_id, work.task_id());
                return Err(e);
            }
        };
        let payload = match self.render(work, &assignment) {
            Ok(p) => p,
            Err(e) => {
                self.book.discard(assignment.id);
                self.registry.release(&agent_id, work.task_id());
                return Err(e);
            }
        };
        self.announce(&assignment);
        Ok(Some(TaskAssignment {
            assignment,
            payload,
        }))
    }

    /// Pick an agent and claim a slot on it. A lost reservation race
    /// triggers a fresh selection.
    fn select_and_reserve(&self, work: &WorkItem) -> FleetResult<Option<String>> {
        if self.registry.is_empty() {
            return Err(FleetError::Resource(format!(
                "no agents registered to take task '{}'",
                work.task.id
            )));
        }

        let task = &work.task;
        let project = work.context.effective_project(task);
        let epic = work.context.effective_epic(task);
        let candidates = self.candidates();
        // Every lost race means another task took a slot, so the total
        // capacity bounds the number of reselections.
        let rounds = candidates
            .iter()
            .map(|c| c.agent.max_concurrent_tasks)
            .sum::<usize>()
            + 1;
        let mut first = Some(candidates);
        for _ in 0..rounds {
            let candidates = first.take().unwrap_or_else(|| self.candidates());
            let Some(selection) = self.selector.select(task, Some(project), epic, &candidates) else {
                return Ok(None);
            };
            if selection.is_capability_driven() {
                if let Some(c) = candidates.iter().find(|c| c.agent.id == selection.agent_id) {
                    self.selector.verify(&c.agent, task)?;
                }
            }
            if self.registry.reserve(&selection.agent_id, &task.id) {
                debug!(
                    task_id = %task.id,
                    agent_id = %selection.agent_id,
                    reason = ?selection.reason,
                    "Agent selected"
                );
                return Ok(Some(selection.agent_id));
            }
            debug!(task_id = %task.id, agent_id = %selection.agent_id, "Reservation lost, reselecting");
        }
        Ok(None)
    }

    fn candidates(&self) -> Vec<Candidate> {
        let mut affinity = self.book.affinity();
        self.registry
            .list()
            .into_iter()
            .map(|agent| {
                let mut candidate = Candidate::new(agent);
                if let Some(a) = affinity.remove(&candidate.agent.id) {
                    candidate.projects = a.projects;
                    candidate.epics = a.epics;
                }
                candidate
            })
            .collect()
    }

    fn render(&self, work: &WorkItem, assignment: &Assignment) -> FleetResult<String> {
        self.protocol
            .format_task(&work.task, &work.context, work.epic_title.as_deref())
            .map_err(|e| {
                FleetError::TaskExecution(format!(
                    "formatting task '{}' for agent '{}' (attempt {}) failed: {e}",
                    assignment.task_id, assignment.agent_id, assignment.attempts
                ))
            })
    }

    fn announce(&self, assignment: &Assignment) {
        info!(
            task_id = %assignment.task_id,
            agent_id = %assignment.agent_id,
            assignment_id = %assignment.id,
            attempt = assignment.attempts,
            "Task assigned"
        );
        self.events.publish(FleetEvent::TaskAssigned {
            task_id: assignment.task_id.clone(),
            agent_id: assignment.agent_id.clone(),
            assignment_id: assignment.id,
            attempt: assignment.attempts,
        });
        self.sync_agent_status(&assignment.agent_id, "assignment");
        self.propagate_task(&assignment.agent_id, &assignment.task_id, "assigned", "assignment");
    }

    /// Send an assignment's payload. A failed send closes the assignment.
    async fn deliver(&self, ticket: &TaskAssignment) -> FleetResult<()> {
        let a = &ticket.assignment;
        match self.dispatcher.send(&a.agent_id, &ticket.payload).await {
            Delivery::Failed(reason) => {
                let err = FleetError::TaskExecution(format!(
                    "delivering task '{}' to agent '{}' (attempt {}) failed: {reason}",
                    a.task_id, a.agent_id, a.attempts
                ));
                self.conclude(a.id, AssignmentStatus::Failed, Some(err.to_string()));
                Err(err)
            }
            Delivery::Delivered(_) | Delivery::Queued => Ok(()),
        }
    }

    /// End the current attempt, free the agent's slot and score the agent.
    ///
    /// Returns `None` when the attempt had already ended or was closed.
    fn end_attempt(
        &self,
        id: Uuid,
        status: AssignmentStatus,
        reason: Option<String>,
    ) -> Option<Assignment> {
        let ended = self.book.transition(id, status, reason).ok()?;
        self.registry.release(&ended.agent_id, &ended.task_id);
        if status == AssignmentStatus::Completed {
            let secs = (Utc::now() - ended.assigned_at).num_milliseconds().max(0) as f64 / 1000.0;
            self.registry.record_completion(&ended.agent_id, secs);
        } else {
            self.registry.record_failure(&ended.agent_id);
        }
        self.sync_agent_status(&ended.agent_id, "monitor");
        self.propagate_task(&ended.agent_id, &ended.task_id, &status.to_string(), "monitor");
        Some(ended)
    }

    /// Give an assignment its final outcome and fire the completion callback.
    ///
    /// Exactly one caller wins for a given assignment; the others get `None`.
    fn conclude(&self, id: Uuid, status: AssignmentStatus, details: Option<String>) -> Option<Assignment> {
        let current = self.book.get(id)?;
        if current.closed {
            return None;
        }
        if !current.status.is_terminal() {
            let reason = if status == AssignmentStatus::Completed {
                None
            } else {
                details.clone()
            };
            self.end_attempt(id, status, reason)?;
        }
        let closed = self.book.close(id, details)?;

        let success = closed.status == AssignmentStatus::Completed;
        if success {
            info!(
                task_id = %closed.task_id,
                agent_id = %closed.agent_id,
                attempts = closed.attempts,
                "Task completed"
            );
            self.events.publish(FleetEvent::TaskCompleted {
                task_id: closed.task_id.clone(),
                agent_id: closed.agent_id.clone(),
            });
        } else {
            let reason = closed
                .details
                .clone()
                .or_else(|| closed.last_error.clone())
                .unwrap_or_else(|| closed.status.to_string());
            warn!(
                task_id = %closed.task_id,
                agent_id = %closed.agent_id,
                attempts = closed.attempts,
                status = %closed.status,
                reason = %reason,
                "Task failed"
            );
            self.events.publish(FleetEvent::TaskFailed {
                task_id: closed.task_id.clone(),
                agent_id: closed.agent_id.clone(),
                reason,
            });
        }
        self.callbacks.fire(TaskCompletion {
            task_id: closed.task_id.clone(),
            success,
            details: closed.details.clone().or_else(|| closed.last_error.clone()),
        });
        Some(closed)
    }

    /// Close an assignment without an outcome and put its task back in the queue.
    fn requeue_assignment(&self, id: Uuid) -> bool {
        let Some(work) = self.book.work(id) else {
            return false;
        };
        let Some(closed) = self.book.close_for_requeue(id) else {
            return false;
        };
        self.registry.release(&closed.agent_id, &closed.task_id);
        self.queue.requeue(work);
        info!(
            task_id = %closed.task_id,
            agent_id = %closed.agent_id,
            attempt = closed.attempts,
            "Task returned to pending queue"
        );
        self.events.publish(FleetEvent::TaskRequeued {
            task_id: closed.task_id.clone(),
            agent_id: closed.agent_id.clone(),
        });
        self.sync_agent_status(&closed.agent_id, "requeue");
        self.propagate_task(&closed.agent_id, &closed.task_id, "requeued", "requeue");
        true
    }

    /// Start the next attempt of an ended assignment on a freshly selected agent.
    ///
    /// `Ok(None)` means no agent is free right now.
    async fn retry_assignment(&self, id: Uuid, timeout: Duration) -> FleetResult<Option<Assignment>> {
        let work = self
            .book
            .work(id)
            .ok_or_else(|| FleetError::NotFound(format!("assignment {id} not found")))?;
        let Some(agent_id) = self.select_and_reserve(&work)? else {
            return Ok(None);
        };
        let next = match self.book.retry(id, &agent_id, timeout) {
            Ok(a) => a,
            Err(e) => {
                self.registry.release(&agent_id, work.task_id());
                return Err(e);
            }
        };
        let payload = match self.render(&work, &next) {
            Ok(p) => p,
            Err(e) => {
                self.end_attempt(id, AssignmentStatus::Failed, Some(e.to_string()));
                return Err(e);
            }
        };
        self.announce(&next);

        match self.dispatcher.send(&agent_id, &payload).await {
            Delivery::Failed(reason) => {
                let err = FleetError::TaskExecution(format!(
                    "redelivering task '{}' to agent '{agent_id}' (attempt {}) failed: {reason}",
                    next.task_id, next.attempts
                ));
                self.end_attempt(id, AssignmentStatus::Failed, Some(err.to_string()));
                Err(err)
            }
            Delivery::Delivered(_) | Delivery::Queued => Ok(Some(next)),
        }
    }

    async fn retry_or_requeue(&self, ended: &Assignment) -> RetryOutcome {
        let timeout = attempt_timeout(ended, self.default_timeout_for(ended.id));
        match self.retry_assignment(ended.id, timeout).await {
            Ok(Some(next)) => RetryOutcome::Redelivered(next),
            Ok(None) => {
                self.requeue_assignment(ended.id);
                RetryOutcome::Requeued
            }
            Err(e) if e.kind() == ErrorKind::Resource => {
                self.requeue_assignment(ended.id);
                RetryOutcome::Requeued
            }
            Err(e) => {
                warn!(task_id = %ended.task_id, error = %e, "Retry failed, closing assignment");
                self.conclude(ended.id, ended.status, Some(e.to_string()));
                RetryOutcome::Closed
            }
        }
    }

    // ------------------------------------------------------------------
    // Responses
    // ------------------------------------------------------------------

    /// Decode and apply a response the agent pushed to us.
    pub async fn process_agent_response(
        &self,
        raw: &str,
        agent_id: &str,
    ) -> FleetResult<ResponseOutcome> {
        self.ensure_running()?;
        if self.registry.get(agent_id).is_none() {
            return Err(FleetError::NotFound(format!(
                "agent '{agent_id}' is not registered"
            )));
        }
        // A reply without a task id belongs to the agent's only open task.
        let open = self.book.open_for_agent(agent_id);
        let expected = match open.as_slice() {
            [only] => Some(only.task_id.as_str()),
            _ => None,
        };
        let response = self.protocol.parse_response(raw, expected)?;
        Ok(self.apply_response(response, agent_id, ResponseSource::Push).await)
    }

    async fn apply_response(
        &self,
        response: AgentResponse,
        agent_id: &str,
        source: ResponseSource,
    ) -> ResponseOutcome {
        let Some(current) = self.book.open_for_task(&response.task_id) else {
            debug!(
                task_id = %response.task_id,
                agent_id,
                status = %response.status,
                "Response for task without open assignment ignored"
            );
            return ResponseOutcome::Ignored;
        };
        if current.agent_id != agent_id {
            warn!(
                task_id = %current.task_id,
                expected = %current.agent_id,
                agent_id,
                "Response from agent that does not hold the task ignored"
            );
            return ResponseOutcome::Ignored;
        }
        if current.status.is_terminal() {
            // The attempt already ended and a retry is being decided.
            return ResponseOutcome::Ignored;
        }

        match response.status {
            ResponseStatus::InProgress => match self.book.touch(current.id, response.progress_percentage) {
                Ok(touched) => {
                    debug!(task_id = %touched.task_id, agent_id, progress = ?touched.progress, "Task progress");
                    if current.status == AssignmentStatus::Assigned {
                        self.propagate_task(agent_id, &touched.task_id, "in_progress", "agent");
                    }
                    self.events.publish(FleetEvent::TaskProgress {
                        task_id: touched.task_id,
                        agent_id: agent_id.to_string(),
                        progress: touched.progress,
                    });
                    ResponseOutcome::Progress
                }
                Err(_) => ResponseOutcome::Ignored,
            },
            ResponseStatus::Done => {
                let details = response.reason().map(String::from);
                if self
                    .conclude(current.id, AssignmentStatus::Completed, details)
                    .is_none()
                {
                    return ResponseOutcome::Ignored;
                }
                self.drain_queue().await;
                ResponseOutcome::Completed
            }
            ResponseStatus::Help | ResponseStatus::Blocked => {
                let label = if response.status == ResponseStatus::Help {
                    "agent requested help"
                } else {
                    "agent is blocked"
                };
                let reason = match response.reason() {
                    Some(r) => format!("{label}: {r}"),
                    None => label.to_string(),
                };
                warn!(task_id = %current.task_id, agent_id, reason = %reason, "Task needs operator attention");
                if self
                    .conclude(current.id, AssignmentStatus::Failed, Some(reason))
                    .is_none()
                {
                    return ResponseOutcome::Ignored;
                }
                self.drain_queue().await;
                ResponseOutcome::Failed
            }
            ResponseStatus::Failed => {
                let reason = match response.reason() {
                    Some(r) => format!("agent reported failure: {r}"),
                    None => "agent reported failure".to_string(),
                };
                let outcome = if source == ResponseSource::Push
                    && current.attempts < self.config.max_retries
                {
                    let Some(ended) =
                        self.end_attempt(current.id, AssignmentStatus::Failed, Some(reason))
                    else {
                        return ResponseOutcome::Ignored;
                    };
                    warn!(
                        task_id = %ended.task_id,
                        agent_id,
                        attempt = ended.attempts,
                        max_retries = self.config.max_retries,
                        "Task failed, retrying"
                    );
                    match self.retry_or_requeue(&ended).await {
                        RetryOutcome::Redelivered(_) => ResponseOutcome::Retried,
                        RetryOutcome::Requeued => ResponseOutcome::Requeued,
                        RetryOutcome::Closed => ResponseOutcome::Failed,
                    }
                } else if self
                    .conclude(current.id, AssignmentStatus::Failed, Some(reason))
                    .is_some()
                {
                    ResponseOutcome::Failed
                } else {
                    return ResponseOutcome::Ignored;
                };
                self.drain_queue().await;
                outcome
            }
        }
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Assign, deliver and monitor `task` until it reaches a final state.
    ///
    /// Never fails: every outcome, including invalid input, is reported in
    /// the returned [`ExecutionResult`], which is also kept for
    /// [`Self::execution_result`].
    pub async fn execute_task(
        &self,
        task: Task,
        context: ProjectContext,
        options: ExecutionOptions,
    ) -> ExecutionResult {
        let started = Instant::now();
        let (execution_id, cancel) = self.executions.start(&task.id);
        let result = self
            .run_execution(execution_id, &cancel, task, context, options, started)
            .await;
        info!(
            execution_id = %execution_id,
            task_id = %result.task_id,
            status = %result.status,
            attempts = result.attempts,
            duration_ms = result.duration_ms,
            "Execution finished"
        );
        self.executions.finish(result.clone());
        result
    }

    async fn run_execution(
        &self,
        execution_id: Uuid,
        cancel: &Notify,
        task: Task,
        context: ProjectContext,
        options: ExecutionOptions,
        started: Instant,
    ) -> ExecutionResult {
        if let Err(e) = task.validate() {
            return outcome(execution_id, &task.id, None, ExecutionStatus::Failed, fault(&e), None, started);
        }
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.default_timeout(&task));
        let poll = options
            .poll_interval
            .unwrap_or_else(|| self.config.poll_interval());
        let task_id = task.id.clone();

        let ticket = match self.assign_work(WorkItem::new(task, context, options.epic_title), timeout) {
            Ok(Some(ticket)) => ticket,
            Ok(None) => {
                return outcome(execution_id, &task_id, None, ExecutionStatus::Queued, None, None, started)
            }
            Err(e) => {
                return outcome(execution_id, &task_id, None, ExecutionStatus::Failed, fault(&e), None, started)
            }
        };
        if let Err(e) = self.deliver(&ticket).await {
            return outcome(
                execution_id,
                &task_id,
                Some(&ticket.assignment),
                ExecutionStatus::Failed,
                fault(&e),
                None,
                started,
            );
        }

        self.monitor(execution_id, cancel, ticket.assignment, timeout, poll, started)
            .await
    }

    /// Poll for responses until the assignment closes, retrying on timeout.
    ///
    /// Outcomes decided elsewhere (pushed responses, liveness requeues) are
    /// adopted as soon as the monitor sees the assignment closed.
    async fn monitor(
        &self,
        execution_id: Uuid,
        cancel: &Notify,
        first: Assignment,
        timeout: Duration,
        poll: Duration,
        started: Instant,
    ) -> ExecutionResult {
        let id = first.id;
        let mut attempt = first.attempts;
        let mut deadline = deadline_after(timeout);
        self.executions
            .attach(execution_id, &first.agent_id, id, attempt, first.expected_completion_at);

        loop {
            let Some(current) = self.book.get(id) else {
                let e = FleetError::TaskExecution(format!("assignment {id} was discarded"));
                return outcome(execution_id, &first.task_id, Some(&first), ExecutionStatus::Failed, fault(&e), None, started);
            };
            if current.closed {
                return adopt(execution_id, &current, started);
            }
            if current.attempts != attempt {
                attempt = current.attempts;
                deadline = deadline_after(timeout);
                self.executions.attach(
                    execution_id,
                    &current.agent_id,
                    id,
                    attempt,
                    current.expected_completion_at,
                );
            }

            let now = Instant::now();
            if now >= deadline {
                if current.status.is_terminal() {
                    // Someone else ended this attempt and is deciding the retry.
                    deadline = now.checked_add(poll).unwrap_or(now);
                } else if let Some(next) = self.expire(&current, timeout).await {
                    attempt = next.attempts;
                    deadline = deadline_after(timeout);
                    self.executions.attach(
                        execution_id,
                        &next.agent_id,
                        id,
                        attempt,
                        next.expected_completion_at,
                    );
                }
                continue;
            }

            let wait = poll.min(deadline - now);
            let polled = tokio::select! {
                _ = cancel.notified() => {
                    info!(execution_id = %execution_id, task_id = %current.task_id, "Execution cancelled");
                    return outcome(
                        execution_id,
                        &current.task_id,
                        Some(&current),
                        ExecutionStatus::Failed,
                        Some(("cancelled".to_string(), ErrorKind::TaskExecution)),
                        None,
                        started,
                    );
                }
                polled = self.poll_once(&current.agent_id, wait) => polled,
            };
            if let Some(raw) = polled {
                // The inbox is per agent; an id-less reply is only ours when
                // the agent holds nothing else.
                let open = self.book.open_for_agent(&current.agent_id);
                let expected = match open.as_slice() {
                    [only] => Some(only.task_id.as_str()),
                    _ => None,
                };
                match self.protocol.parse_response(&raw, expected) {
                    Ok(response) => {
                        self.apply_response(response, &current.agent_id, ResponseSource::Monitor)
                            .await;
                    }
                    Err(e) => warn!(
                        task_id = %current.task_id,
                        agent_id = %current.agent_id,
                        error = %e,
                        "Unreadable agent response dropped"
                    ),
                }
            }
        }
    }

    async fn poll_once(&self, agent_id: &str, wait: Duration) -> Option<String> {
        match self.dispatcher.receive(agent_id, wait).await {
            Ok(raw) => Some(raw),
            Err(FleetError::Timeout(_)) => None,
            Err(e) => {
                debug!(agent_id, error = %e, "Receive failed");
                tokio::time::sleep(wait).await;
                None
            }
        }
    }

    /// Time out the current attempt. Returns the next attempt when the task
    /// was redelivered.
    async fn expire(&self, current: &Assignment, timeout: Duration) -> Option<Assignment> {
        let reason = format!(
            "agent '{}' did not finish task '{}' within {}s (attempt {})",
            current.agent_id,
            current.task_id,
            timeout.as_secs(),
            current.attempts
        );
        let ended = self.end_attempt(current.id, AssignmentStatus::Timeout, Some(reason.clone()))?;
        warn!(
            task_id = %ended.task_id,
            agent_id = %ended.agent_id,
            attempt = ended.attempts,
            max_retries = self.config.max_retries,
            "Task timed out"
        );

        if ended.attempts < self.config.max_retries {
            match self.retry_or_requeue(&ended).await {
                RetryOutcome::Redelivered(next) => Some(next),
                RetryOutcome::Requeued | RetryOutcome::Closed => None,
            }
        } else {
            self.conclude(ended.id, AssignmentStatus::Timeout, Some(reason));
            None
        }
    }

    /// Stop a running `execute_task` monitor. The assignment itself is left
    /// alone. Returns false when no such execution is running.
    pub fn cancel_execution(&self, execution_id: Uuid) -> bool {
        self.executions.cancel(execution_id)
    }

    /// Result of a finished execution, while retained.
    pub fn execution_result(&self, execution_id: Uuid) -> Option<ExecutionResult> {
        self.executions.result(execution_id)
    }

    /// Executions still running.
    pub fn active_executions(&self) -> Vec<ExecutionRecord> {
        self.executions.active()
    }

    /// Register a one-shot callback for the final outcome of `task_id`.
    pub fn register_task_completion_callback(
        &self,
        task_id: impl Into<String>,
        callback: impl FnOnce(TaskCompletion) + Send + 'static,
    ) {
        self.callbacks.register(task_id, Box::new(callback));
    }

    // ------------------------------------------------------------------
    // Queue and liveness
    // ------------------------------------------------------------------

    /// Try to place every queued task, in service order. Returns how many
    /// were delivered.
    pub async fn drain_queue(&self) -> usize {
        if self.is_destroyed() || self.queue.is_empty() {
            return 0;
        }
        let _gate = self.drain_gate.lock().await;

        let mut dispatched = 0;
        for entry in self.queue.snapshot() {
            let task_id = entry.item.task_id().to_string();
            if self.book.open_for_task(&task_id).is_some() {
                self.queue.remove(&task_id);
                continue;
            }
            let timeout = self.default_timeout(&entry.item.task);
            match self.open_assignment(&entry.item, timeout) {
                Ok(Some(ticket)) => {
                    self.queue.remove(&task_id);
                    if self.deliver(&ticket).await.is_ok() {
                        dispatched += 1;
                    }
                }
                Ok(None) => {}
                Err(e) if e.kind() == ErrorKind::Resource => break,
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Queued task cannot be assigned, dropping it");
                    self.queue.remove(&task_id);
                    self.callbacks.fire(TaskCompletion {
                        task_id,
                        success: false,
                        details: Some(e.to_string()),
                    });
                }
            }
        }
        if dispatched > 0 {
            info!(dispatched, pending = self.queue.len(), "Pending queue drained");
        }
        dispatched
    }

    /// Run one heartbeat sweep: take silent agents offline and requeue
    /// their work, then prune old results.
    pub async fn sweep_liveness(&self) -> Vec<Ejection> {
        self.sweep_liveness_at(Utc::now()).await
    }

    /// [`Self::sweep_liveness`] as of `now`.
    pub async fn sweep_liveness_at(&self, now: DateTime<Utc>) -> Vec<Ejection> {
        if self.is_destroyed() {
            return Vec::new();
        }
        let ejected = self.liveness.sweep(&self.registry, now);
        for e in &ejected {
            let requeued = self
                .book
                .open_for_agent(&e.agent_id)
                .iter()
                .filter(|a| self.requeue_assignment(a.id))
                .count();
            for task_id in &e.held_tasks {
                self.registry.release(&e.agent_id, task_id);
            }
            warn!(agent_id = %e.agent_id, missed = e.missed, requeued, "Agent went silent, work requeued");
            self.events.publish(FleetEvent::AgentOffline {
                agent_id: e.agent_id.clone(),
                missed_heartbeats: e.missed,
            });
            self.propagate_agent(&e.agent_id, AgentStatus::Offline, "liveness");
        }

        self.book.prune_closed(self.config.result_retention());
        self.executions.prune();
        if !ejected.is_empty() {
            self.drain_queue().await;
        }
        ejected
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Fleet-wide counters.
    pub fn agent_stats(&self) -> AgentStats {
        let agents = self.registry.list();
        let count = |status: AgentStatus| agents.iter().filter(|a| a.status == status).count();
        AgentStats {
            total_agents: agents.len(),
            available_agents: count(AgentStatus::Available),
            busy_agents: count(AgentStatus::Busy),
            offline_agents: count(AgentStatus::Offline),
            error_agents: count(AgentStatus::Error),
            total_capacity: agents.iter().map(|a| a.max_concurrent_tasks).sum(),
            tasks_in_flight: agents.iter().map(|a| a.current_tasks.len()).sum(),
            pending_tasks: self.queue.len(),
            active_assignments: self.book.open_count(),
            active_executions: self.executions.active_count(),
        }
    }

    /// Every known assignment, oldest first, closed ones included until pruned.
    pub fn assignments(&self) -> Vec<Assignment> {
        self.book.snapshot()
    }

    /// Snapshot of one assignment.
    pub fn assignment(&self, id: Uuid) -> Option<Assignment> {
        self.book.get(id)
    }

    /// Queued tasks in the order they will be served.
    pub fn pending_tasks(&self) -> Vec<PendingEntry> {
        self.queue.snapshot()
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn ensure_running(&self) -> FleetResult<()> {
        if self.is_destroyed() {
            Err(FleetError::Resource("orchestrator has been destroyed".into()))
        } else {
            Ok(())
        }
    }

    fn default_timeout(&self, task: &Task) -> Duration {
        Complexity::of(task).timeout(self.config.base_timeout())
    }

    fn default_timeout_for(&self, id: Uuid) -> Duration {
        self.book
            .work(id)
            .map_or_else(|| self.config.base_timeout(), |w| self.default_timeout(&w.task))
    }

    fn sync_agent_status(&self, agent_id: &str, source: &'static str) {
        if let Some(agent) = self.registry.get(agent_id) {
            self.propagate_agent(agent_id, agent.status, source);
        }
    }

    fn propagate_agent(&self, agent_id: &str, status: AgentStatus, source: &'static str) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let propagator = self.propagator.clone();
        let agent_id = agent_id.to_string();
        runtime.spawn(async move {
            if let Err(e) = propagator
                .propagate_status_change(&agent_id, status, source)
                .await
            {
                warn!(agent_id = %agent_id, error = %e, "Agent status propagation failed");
            }
        });
    }

    fn propagate_task(&self, agent_id: &str, task_id: &str, status: &str, source: &'static str) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let propagator = self.propagator.clone();
        let agent_id = agent_id.to_string();
        let task_id = task_id.to_string();
        let status = status.to_string();
        runtime.spawn(async move {
            if let Err(e) = propagator
                .propagate_task_status_change(&agent_id, &task_id, &status, source)
                .await
            {
                warn!(agent_id = %agent_id, task_id = %task_id, error = %e, "Task status propagation failed");
            }
        });
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        for handle in self.background.get_mut().drain(..) {
            handle.abort();
        }
    }
}

/// Ceiling for monitor deadlines; longer timeouts never fire in practice.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout.min(FAR_FUTURE))
        .or_else(|| now.checked_add(Duration::from_secs(24 * 3600)))
        .unwrap_or(now)
}

/// The timeout an assignment's current attempt was opened with.
fn attempt_timeout(a: &Assignment, fallback: Duration) -> Duration {
    (a.expected_completion_at - a.assigned_at)
        .to_std()
        .unwrap_or(fallback)
}

fn fault(e: &FleetError) -> Option<(String, ErrorKind)> {
    Some((e.to_string(), e.kind()))
}

fn outcome(
    execution_id: Uuid,
    task_id: &str,
    assignment: Option<&Assignment>,
    status: ExecutionStatus,
    error: Option<(String, ErrorKind)>,
    details: Option<String>,
    started: Instant,
) -> ExecutionResult {
    let (error, error_kind) = match error {
        Some((message, kind)) => (Some(message), Some(kind)),
        None => (None, None),
    };
    ExecutionResult {
        execution_id,
        task_id: task_id.to_string(),
        agent_id: assignment.map(|a| a.agent_id.clone()),
        assignment_id: assignment.map(|a| a.id),
        success: status == ExecutionStatus::Completed,
        status,
        attempts: assignment.map_or(0, |a| a.attempts),
        error,
        error_kind,
        details,
        duration_ms: started.elapsed().as_millis() as u64,
        finished_at: Utc::now(),
    }
}

/// Result for an assignment that was closed, by whichever path closed it.
fn adopt(execution_id: Uuid, a: &Assignment, started: Instant) -> ExecutionResult {
    if a.requeued {
        return outcome(execution_id, &a.task_id, Some(a), ExecutionStatus::Queued, None, None, started);
    }
    let reason = || {
        a.details
            .clone()
            .or_else(|| a.last_error.clone())
            .unwrap_or_else(|| a.status.to_string())
    };
    match a.status {
        AssignmentStatus::Completed => outcome(
            execution_id,
            &a.task_id,
            Some(a),
            ExecutionStatus::Completed,
            None,
            a.details.clone(),
            started,
        ),
        AssignmentStatus::Timeout => outcome(
            execution_id,
            &a.task_id,
            Some(a),
            ExecutionStatus::Timeout,
            Some((reason(), ErrorKind::Timeout)),
            None,
            started,
        ),
        _ => outcome(
            execution_id,
            &a.task_id,
            Some(a),
            ExecutionStatus::Failed,
            Some((reason(), ErrorKind::TaskExecution)),
            None,
            started,
        ),
    }
}
