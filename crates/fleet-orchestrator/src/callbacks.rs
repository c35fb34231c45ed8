use crate::types::TaskCompletion;
use async_trait::async_trait;
use fleet_core::{AgentStatus, FleetResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

/// Callback run once when a task reaches its final outcome.
pub type CompletionCallback = Box<dyn FnOnce(TaskCompletion) + Send + 'static>;

/// One-shot completion callbacks keyed by task id.
#[derive(Default)]
pub struct CompletionCallbacks {
    callbacks: Mutex<HashMap<String, CompletionCallback>>,
}

impl CompletionCallbacks {
    /// No callbacks registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `task_id`, replacing any earlier one.
    pub fn register(&self, task_id: impl Into<String>, callback: CompletionCallback) {
        self.callbacks.lock().insert(task_id.into(), callback);
    }

    /// Run and remove the callback for `completion.task_id`, if any.
    pub fn fire(&self, completion: TaskCompletion) -> bool {
        let Some(callback) = self.callbacks.lock().remove(&completion.task_id) else {
            return false;
        };
        debug!(task_id = %completion.task_id, success = completion.success, "Firing completion callback");
        callback(completion);
        true
    }

    /// Whether a callback waits on `task_id`.
    pub fn is_registered(&self, task_id: &str) -> bool {
        self.callbacks.lock().contains_key(task_id)
    }

    /// Drop every pending callback without calling it.
    pub fn clear(&self) {
        self.callbacks.lock().clear();
    }
}

/// Mirror of agent and task status changes into an external registry.
///
/// Calls are best effort: errors are logged and never affect dispatch.
#[async_trait]
pub trait StatusPropagator: Send + Sync {
    /// Mirror an agent status change.
    async fn propagate_status_change(
        &self,
        agent_id: &str,
        status: AgentStatus,
        source: &str,
    ) -> FleetResult<()>;

    /// Mirror a task status change on behalf of an agent.
    async fn propagate_task_status_change(
        &self,
        agent_id: &str,
        task_id: &str,
        status: &str,
        source: &str,
    ) -> FleetResult<()>;
}

/// Propagator that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPropagator;

#[async_trait]
impl StatusPropagator for NoopPropagator {
    async fn propagate_status_change(&self, _: &str, _: AgentStatus, _: &str) -> FleetResult<()> {
        Ok(())
    }

    async fn propagate_task_status_change(
        &self,
        _: &str,
        _: &str,
        _: &str,
        _: &str,
    ) -> FleetResult<()> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn completion(task_id: &str) -> TaskCompletion {
        TaskCompletion {
            task_id: task_id.into(),
            success: true,
            details: None,
        }
    }

    #[test]
    fn test_callback_fires_once() {
        let cbs = CompletionCallbacks::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        cbs.register(
            "t1",
            Box::new(move |done| {
                assert!(done.success);
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(cbs.is_registered("t1"));
        assert!(cbs.fire(completion("t1")));
        assert!(!cbs.fire(completion("t1")));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!cbs.is_registered("t1"));
    }

    #[test]
    fn test_unknown_task_is_noop() {
        let cbs = CompletionCallbacks::new();
        assert!(!cbs.fire(completion("nobody")));
    }

    #[tokio::test]
    async fn test_noop_propagator() {
        let p = NoopPropagator;
        assert!(p
            .propagate_status_change("a1", AgentStatus::Busy, "test")
            .await
            .is_ok());
    }
}
