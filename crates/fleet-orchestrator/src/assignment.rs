use crate::task_queue::WorkItem;
use crate::types::{Assignment, AssignmentContext, AssignmentStatus};
use chrono::{DateTime, Utc};
use fleet_core::{FleetError, FleetResult};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Record {
    assignment: Assignment,
    // Kept for every retry, requeue and drain of this task.
    work: WorkItem,
    closed_at: Option<DateTime<Utc>>,
}

/// Projects and epics an agent is currently working in.
#[derive(Debug, Clone, Default)]
pub struct AgentAffinity {
    /// Projects of the open assignments.
    pub projects: HashSet<String>,
    /// Epics of the open assignments.
    pub epics: HashSet<String>,
}

/// All assignments, keyed by id, with at most one open per task id.
///
/// Each assignment sits behind its own mutex so state transitions on one
/// task never wait on another.
#[derive(Default)]
pub struct AssignmentBook {
    records: RwLock<HashMap<Uuid, Arc<Mutex<Record>>>>,
    open_by_task: Mutex<HashMap<String, Uuid>>,
}

fn span(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(3650))
}

fn deadline(from: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    from.checked_add_signed(span(timeout)).unwrap_or(from)
}

impl AssignmentBook {
    /// Empty book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the first attempt for `work` on `agent_id`.
    ///
    /// Fails when the task already has an open assignment.
    pub fn open(&self, work: WorkItem, agent_id: &str, timeout: Duration) -> FleetResult<Assignment> {
        let mut open = self.open_by_task.lock();
        if let Some(existing) = open.get(&work.task.id) {
            return Err(FleetError::Validation(format!(
                "task '{}' already has open assignment {existing}",
                work.task.id
            )));
        }

        let now = Utc::now();
        let task = &work.task;
        let assignment = Assignment {
            id: Uuid::new_v4(),
            task_id: task.id.clone(),
            agent_id: agent_id.to_string(),
            status: AssignmentStatus::Assigned,
            assigned_at: now,
            expected_completion_at: deadline(now, timeout),
            last_status_update: now,
            attempts: 1,
            priority: task.priority,
            estimated_duration_secs: task
                .estimated_hours
                .map_or(timeout.as_secs(), |h| (h.max(0.0) * 3600.0) as u64),
            context: AssignmentContext {
                project_id: work.context.effective_project(task).to_string(),
                epic_id: work.context.effective_epic(task).map(String::from),
                dependencies: task.dependencies.clone(),
            },
            closed: false,
            last_error: None,
            progress: None,
            details: None,
            requeued: false,
        };

        open.insert(assignment.task_id.clone(), assignment.id);
        self.records.write().insert(
            assignment.id,
            Arc::new(Mutex::new(Record {
                assignment: assignment.clone(),
                work,
                closed_at: None,
            })),
        );
        Ok(assignment)
    }

    /// Snapshot of one assignment.
    pub fn get(&self, id: Uuid) -> Option<Assignment> {
        self.record(id).map(|r| r.lock().assignment.clone())
    }

    /// The retained task, context and epic title for an assignment.
    pub fn work(&self, id: Uuid) -> Option<WorkItem> {
        self.record(id).map(|r| r.lock().work.clone())
    }

    /// The open assignment for `task_id`, if any.
    pub fn open_for_task(&self, task_id: &str) -> Option<Assignment> {
        let id = *self.open_by_task.lock().get(task_id)?;
        self.get(id)
    }

    /// Open assignments currently held by `agent_id`.
    pub fn open_for_agent(&self, agent_id: &str) -> Vec<Assignment> {
        let mut out: Vec<Assignment> = self
            .snapshot()
            .into_iter()
            .filter(|a| !a.closed && a.agent_id == agent_id)
            .collect();
        out.sort_by_key(|a| a.assigned_at);
        out
    }

    /// Apply a forward transition to the current attempt.
    pub fn transition(
        &self,
        id: Uuid,
        next: AssignmentStatus,
        error: Option<String>,
    ) -> FleetResult<Assignment> {
        let record = self.require(id)?;
        let mut record = record.lock();
        let a = &mut record.assignment;
        if a.closed {
            return Err(FleetError::Validation(format!(
                "assignment {id} is closed ({})",
                a.status
            )));
        }
        if !a.status.can_transition_to(next) {
            return Err(FleetError::Validation(format!(
                "assignment {id} cannot move from {} to {next}",
                a.status
            )));
        }
        a.status = next;
        a.last_status_update = Utc::now();
        if error.is_some() {
            a.last_error = error;
        }
        Ok(a.clone())
    }

    /// Record progress reported by the agent and mark the attempt in progress.
    pub fn touch(&self, id: Uuid, progress: Option<u8>) -> FleetResult<Assignment> {
        let record = self.require(id)?;
        let mut record = record.lock();
        let a = &mut record.assignment;
        if a.closed || !a.status.can_transition_to(AssignmentStatus::InProgress) {
            return Err(FleetError::Validation(format!(
                "assignment {id} is {} and accepts no progress",
                a.status
            )));
        }
        a.status = AssignmentStatus::InProgress;
        a.last_status_update = Utc::now();
        if let Some(p) = progress {
            a.progress = Some(p.min(100));
        }
        Ok(a.clone())
    }

    /// Start a new attempt after a failure or timeout, possibly on another agent.
    pub fn retry(&self, id: Uuid, agent_id: &str, timeout: Duration) -> FleetResult<Assignment> {
        let record = self.require(id)?;
        let mut record = record.lock();
        let a = &mut record.assignment;
        if a.closed {
            return Err(FleetError::Validation(format!("assignment {id} is closed")));
        }
        if !matches!(a.status, AssignmentStatus::Failed | AssignmentStatus::Timeout) {
            return Err(FleetError::Validation(format!(
                "assignment {id} is {} and cannot be retried",
                a.status
            )));
        }
        let now = Utc::now();
        a.attempts += 1;
        a.agent_id = agent_id.to_string();
        a.status = AssignmentStatus::Assigned;
        a.assigned_at = now;
        a.expected_completion_at = deadline(now, timeout);
        a.last_status_update = now;
        a.progress = None;
        Ok(a.clone())
    }

    /// Close an assignment; later transitions are rejected. Returns `None`
    /// when it was already closed, so callers can fire side effects once.
    pub fn close(&self, id: Uuid, details: Option<String>) -> Option<Assignment> {
        self.close_with(id, |a| a.details = details)
    }

    /// Close an assignment whose task is going back to the queue.
    pub fn close_for_requeue(&self, id: Uuid) -> Option<Assignment> {
        self.close_with(id, |a| a.requeued = true)
    }

    fn close_with(&self, id: Uuid, finish: impl FnOnce(&mut Assignment)) -> Option<Assignment> {
        let record = self.record(id)?;
        let closed = {
            let mut record = record.lock();
            if record.assignment.closed {
                return None;
            }
            finish(&mut record.assignment);
            record.assignment.closed = true;
            record.closed_at = Some(Utc::now());
            record.assignment.clone()
        };
        let mut open = self.open_by_task.lock();
        if open.get(&closed.task_id) == Some(&id) {
            open.remove(&closed.task_id);
        }
        Some(closed)
    }

    /// Forget an assignment entirely, as if it was never opened.
    pub fn discard(&self, id: Uuid) -> Option<Assignment> {
        let record = self.records.write().remove(&id)?;
        let assignment = record.lock().assignment.clone();
        let mut open = self.open_by_task.lock();
        if open.get(&assignment.task_id) == Some(&id) {
            open.remove(&assignment.task_id);
        }
        Some(assignment)
    }

    /// Every assignment, oldest first.
    pub fn snapshot(&self) -> Vec<Assignment> {
        let records: Vec<Arc<Mutex<Record>>> = self.records.read().values().cloned().collect();
        let mut out: Vec<Assignment> = records.iter().map(|r| r.lock().assignment.clone()).collect();
        out.sort_by_key(|a| a.assigned_at);
        out
    }

    /// Assignments not yet closed.
    pub fn open_count(&self) -> usize {
        self.open_by_task.lock().len()
    }

    /// Projects and epics of the open work held by each agent.
    pub fn affinity(&self) -> HashMap<String, AgentAffinity> {
        let mut out: HashMap<String, AgentAffinity> = HashMap::new();
        for a in self.snapshot().into_iter().filter(|a| !a.closed) {
            let entry = out.entry(a.agent_id).or_default();
            entry.projects.insert(a.context.project_id);
            if let Some(epic) = a.context.epic_id {
                entry.epics.insert(epic);
            }
        }
        out
    }

    /// Drop closed assignments older than `retention`.
    pub fn prune_closed(&self, retention: Duration) -> usize {
        let cutoff = Utc::now()
            .checked_sub_signed(span(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, r| r.lock().closed_at.map_or(true, |t| t > cutoff));
        before - records.len()
    }

    /// Drop every assignment.
    pub fn clear(&self) {
        self.records.write().clear();
        self.open_by_task.lock().clear();
    }

    fn record(&self, id: Uuid) -> Option<Arc<Mutex<Record>>> {
        self.records.read().get(&id).cloned()
    }

    fn require(&self, id: Uuid) -> FleetResult<Arc<Mutex<Record>>> {
        self.record(id)
            .ok_or_else(|| FleetError::NotFound(format!("assignment {id} not found")))
    }
}
