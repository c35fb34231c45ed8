use chrono::{DateTime, Utc};
use fleet_core::{ProjectContext, Task, TaskPriority};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

/// A task together with everything needed to (re)deliver it.
#[derive(Debug, Clone, Serialize)]
pub struct WorkItem {
    /// The task to deliver.
    pub task: Task,
    /// Project context sent with the task.
    pub context: ProjectContext,
    /// Epic title shown in the payload.
    pub epic_title: Option<String>,
}

impl WorkItem {
    /// Bundle a task with its context.
    pub fn new(task: Task, context: ProjectContext, epic_title: Option<String>) -> Self {
        Self {
            task,
            context,
            epic_title,
        }
    }

    /// Id of the wrapped task.
    pub fn task_id(&self) -> &str {
        &self.task.id
    }
}

/// A queued work item and when it entered the queue.
#[derive(Debug, Clone, Serialize)]
pub struct PendingEntry {
    /// The queued work.
    pub item: WorkItem,
    /// When the entry joined the queue.
    pub queued_at: DateTime<Utc>,
    /// Put back after an abandoned assignment rather than queued fresh.
    pub requeued: bool,
}

/// Tasks waiting for a free agent.
///
/// FIFO within a priority class, classes served `urgent > high > normal >
/// low`, at most one entry per task id.
#[derive(Default)]
pub struct PendingQueue {
    // Indexed by priority rank: 0 = urgent .. 3 = low.
    lanes: Mutex<[VecDeque<PendingEntry>; 4]>,
}

fn rank(priority: TaskPriority) -> usize {
    match priority {
        TaskPriority::Urgent => 0,
        TaskPriority::High => 1,
        TaskPriority::Normal => 2,
        TaskPriority::Low => 3,
    }
}

impl PendingQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue at the back of its priority class. Returns false when the
    /// task is already queued.
    pub fn push(&self, item: WorkItem) -> bool {
        self.insert(item, false)
    }

    /// Put a task back after its assignment was abandoned.
    pub fn requeue(&self, item: WorkItem) -> bool {
        self.insert(item, true)
    }

    fn insert(&self, item: WorkItem, requeued: bool) -> bool {
        let mut lanes = self.lanes.lock();
        if lanes.iter().flatten().any(|e| e.item.task.id == item.task.id) {
            return false;
        }
        let entry = PendingEntry {
            queued_at: Utc::now(),
            requeued,
            item,
        };
        lanes[rank(entry.item.task.priority)].push_back(entry);
        true
    }

    /// Entries in service order.
    pub fn snapshot(&self) -> Vec<PendingEntry> {
        self.lanes.lock().iter().flatten().cloned().collect()
    }

    /// Remove one entry by task id.
    pub fn remove(&self, task_id: &str) -> Option<PendingEntry> {
        let mut lanes = self.lanes.lock();
        for lane in lanes.iter_mut() {
            if let Some(pos) = lane.iter().position(|e| e.item.task.id == task_id) {
                return lane.remove(pos);
            }
        }
        None
    }

    /// Whether `task_id` is queued.
    pub fn contains(&self, task_id: &str) -> bool {
        self.lanes
            .lock()
            .iter()
            .flatten()
            .any(|e| e.item.task.id == task_id)
    }

    /// Queued entry count.
    pub fn len(&self) -> usize {
        self.lanes.lock().iter().map(VecDeque::len).sum()
    }

    /// Nothing queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry.
    pub fn clear(&self) {
        for lane in self.lanes.lock().iter_mut() {
            lane.clear();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use fleet_core::TaskType;

    fn item(id: &str, priority: TaskPriority) -> WorkItem {
        WorkItem::new(
            Task::new(id, format!("task {id}"), TaskType::Backend).with_priority(priority),
            ProjectContext::new("p"),
            None,
        )
    }

    fn order(q: &PendingQueue) -> Vec<String> {
        q.snapshot().into_iter().map(|e| e.item.task.id).collect()
    }

    #[test]
    fn test_empty_queue() {
        let q = PendingQueue::new();
        assert!(q.is_empty());
        assert!(q.snapshot().is_empty());
        assert!(q.remove("x").is_none());
    }

    #[test]
    fn test_priority_then_fifo() {
        let q = PendingQueue::new();
        q.push(item("low", TaskPriority::Low));
        q.push(item("n1", TaskPriority::Normal));
        q.push(item("urgent", TaskPriority::Urgent));
        q.push(item("n2", TaskPriority::Normal));
        q.push(item("high", TaskPriority::High));
        assert_eq!(order(&q), vec!["urgent", "high", "n1", "n2", "low"]);
    }

    #[test]
    fn test_duplicate_task_ignored() {
        let q = PendingQueue::new();
        assert!(q.push(item("t1", TaskPriority::Normal)));
        assert!(!q.push(item("t1", TaskPriority::High)));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_requeue_keeps_fifo_and_flags_entry() {
        let q = PendingQueue::new();
        q.push(item("n1", TaskPriority::Normal));
        assert!(q.requeue(item("back", TaskPriority::Normal)));
        assert!(!q.requeue(item("n1", TaskPriority::Normal)));
        assert_eq!(order(&q), vec!["n1", "back"]);
        assert!(!q.snapshot()[0].requeued);
        assert!(q.snapshot()[1].requeued);
    }

    #[test]
    fn test_remove_and_contains() {
        let q = PendingQueue::new();
        q.push(item("t1", TaskPriority::Normal));
        q.push(item("t2", TaskPriority::Low));
        assert!(q.contains("t2"));
        let removed = q.remove("t2").unwrap();
        assert_eq!(removed.item.task_id(), "t2");
        assert!(!q.contains("t2"));
        q.clear();
        assert!(q.is_empty());
    }
}
