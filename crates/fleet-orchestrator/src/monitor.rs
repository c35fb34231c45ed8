use crate::types::{ExecutionResult, ExecutionStatus};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// A running `execute_task` call.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    /// Id of the `execute_task` call.
    pub execution_id: Uuid,
    /// Task being executed.
    pub task_id: String,
    /// Agent of the current attempt.
    pub agent_id: Option<String>,
    /// Assignment of the current attempt.
    pub assignment_id: Option<Uuid>,
    /// Current status.
    pub status: ExecutionStatus,
    /// Attempts made so far.
    pub attempts: u32,
    /// When the call began.
    pub started_at: DateTime<Utc>,
    /// When the monitor gives up.
    pub deadline: Option<DateTime<Utc>>,
}

struct Active {
    record: ExecutionRecord,
    cancel: Arc<Notify>,
}

/// Tracks running executions and keeps finished results for a while.
pub struct ExecutionTracker {
    active: RwLock<HashMap<Uuid, Active>>,
    results: RwLock<HashMap<Uuid, ExecutionResult>>,
    retention: Duration,
}

impl ExecutionTracker {
    /// Board that keeps results for `retention`.
    pub fn new(retention: Duration) -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            results: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// Begin tracking a call. The returned notify fires on cancellation.
    pub fn start(&self, task_id: &str) -> (Uuid, Arc<Notify>) {
        let execution_id = Uuid::new_v4();
        let cancel = Arc::new(Notify::new());
        self.active.write().insert(
            execution_id,
            Active {
                record: ExecutionRecord {
                    execution_id,
                    task_id: task_id.to_string(),
                    agent_id: None,
                    assignment_id: None,
                    status: ExecutionStatus::Queued,
                    attempts: 0,
                    started_at: Utc::now(),
                    deadline: None,
                },
                cancel: cancel.clone(),
            },
        );
        (execution_id, cancel)
    }

    /// Point the execution at its current attempt.
    pub fn attach(
        &self,
        execution_id: Uuid,
        agent_id: &str,
        assignment_id: Uuid,
        attempts: u32,
        deadline: DateTime<Utc>,
    ) {
        if let Some(a) = self.active.write().get_mut(&execution_id) {
            a.record.agent_id = Some(agent_id.to_string());
            a.record.assignment_id = Some(assignment_id);
            a.record.attempts = attempts;
            a.record.deadline = Some(deadline);
            a.record.status = ExecutionStatus::InProgress;
        }
    }

    /// Stop tracking and store the final result.
    pub fn finish(&self, result: ExecutionResult) {
        self.active.write().remove(&result.execution_id);
        self.prune();
        self.results.write().insert(result.execution_id, result);
    }

    /// Signal the execution's monitor to stop. Returns false when it is
    /// not running.
    pub fn cancel(&self, execution_id: Uuid) -> bool {
        let Some(cancel) = self
            .active
            .read()
            .get(&execution_id)
            .map(|a| a.cancel.clone())
        else {
            return false;
        };
        cancel.notify_one();
        true
    }

    /// Every running execution.
    pub fn active(&self) -> Vec<ExecutionRecord> {
        let mut out: Vec<ExecutionRecord> =
            self.active.read().values().map(|a| a.record.clone()).collect();
        out.sort_by_key(|r| r.started_at);
        out
    }

    /// Running execution count.
    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    /// Retained result for `execution_id`.
    pub fn result(&self, execution_id: Uuid) -> Option<ExecutionResult> {
        self.results.read().get(&execution_id).cloned()
    }

    /// Drop results older than the retention window.
    pub fn prune(&self) -> usize {
        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return 0;
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            return 0;
        };
        let mut results = self.results.write();
        let before = results.len();
        results.retain(|_, r| r.finished_at > cutoff);
        before - results.len()
    }

    /// Cancel every running execution and forget all results.
    pub fn clear(&self) {
        for a in self.active.write().drain().map(|(_, a)| a) {
            a.cancel.notify_one();
        }
        self.results.write().clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn result(id: Uuid, finished_at: DateTime<Utc>) -> ExecutionResult {
        ExecutionResult {
            execution_id: id,
            task_id: "t1".into(),
            agent_id: Some("a1".into()),
            assignment_id: None,
            success: true,
            status: ExecutionStatus::Completed,
            attempts: 1,
            error: None,
            error_kind: None,
            details: None,
            duration_ms: 5,
            finished_at,
        }
    }

    #[test]
    fn test_lifecycle() {
        let tracker = ExecutionTracker::new(Duration::from_secs(60));
        let (id, _) = tracker.start("t1");
        assert_eq!(tracker.active()[0].status, ExecutionStatus::Queued);

        tracker.attach(id, "a1", Uuid::new_v4(), 1, Utc::now());
        let rec = &tracker.active()[0];
        assert_eq!(rec.status, ExecutionStatus::InProgress);
        assert_eq!(rec.agent_id.as_deref(), Some("a1"));

        tracker.finish(result(id, Utc::now()));
        assert_eq!(tracker.active_count(), 0);
        assert!(tracker.result(id).unwrap().success);
    }

    #[tokio::test]
    async fn test_cancel_signals_monitor() {
        let tracker = ExecutionTracker::new(Duration::from_secs(60));
        let (id, cancel) = tracker.start("t1");
        assert!(tracker.cancel(id));
        // Permit is stored even if nobody was waiting yet.
        tokio::time::timeout(Duration::from_millis(100), cancel.notified())
            .await
            .unwrap();
        assert!(!tracker.cancel(Uuid::new_v4()));
    }

    #[test]
    fn test_prune_drops_expired_results() {
        let tracker = ExecutionTracker::new(Duration::from_secs(60));
        let old = Uuid::new_v4();
        tracker.finish(result(old, Utc::now() - chrono::Duration::seconds(120)));
        let fresh = Uuid::new_v4();
        tracker.finish(result(fresh, Utc::now()));

        assert!(tracker.result(old).is_none());
        assert!(tracker.result(fresh).is_some());
    }
}
