use fleet_core::{Task, TaskPriority, TaskType};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Coarse size class of a task, used to scale execution timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    /// One unit of base timeout.
    Simple,
    /// One and a half units.
    Moderate,
    /// Two units.
    Complex,
    /// Three units.
    Critical,
}

impl Complexity {
    /// Classify `task` from its estimate, priority, dependencies and type.
    pub fn of(task: &Task) -> Self {
        let mut score = match task.estimated_hours {
            Some(h) if h <= 1.0 => 1,
            Some(h) if h <= 4.0 => 2,
            Some(h) if h <= 8.0 => 3,
            Some(_) => 4,
            None => 1,
        };
        if task.priority >= TaskPriority::High {
            score += 1;
        }
        if task.dependencies.len() > 3 {
            score += 1;
        }
        if matches!(
            task.task_type,
            TaskType::Database | TaskType::Devops | TaskType::Refactoring | TaskType::Deployment
        ) {
            score += 1;
        }

        match score {
            s if s <= 2 => Complexity::Simple,
            3 => Complexity::Moderate,
            4 => Complexity::Complex,
            _ => Complexity::Critical,
        }
    }

    /// Factor applied to the base timeout.
    pub fn multiplier(self) -> f64 {
        match self {
            Complexity::Simple => 1.0,
            Complexity::Moderate => 1.5,
            Complexity::Complex => 2.0,
            Complexity::Critical => 3.0,
        }
    }

    /// `base` scaled by this class, saturating at `Duration::MAX`.
    pub fn timeout(self, base: Duration) -> Duration {
        Duration::try_from_secs_f64(base.as_secs_f64() * self.multiplier()).unwrap_or(Duration::MAX)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_saturates() {
        assert_eq!(Complexity::Critical.timeout(Duration::MAX), Duration::MAX);
        assert_eq!(
            Complexity::Moderate.timeout(Duration::from_secs(100)),
            Duration::from_secs(150)
        );
    }

    #[test]
    fn test_unestimated_task_is_simple() {
        let t = Task::new("t", "x", TaskType::Frontend);
        assert_eq!(Complexity::of(&t), Complexity::Simple);
    }

    #[test]
    fn test_buckets() {
        let moderate = Task::new("t", "x", TaskType::Backend).with_estimate(6.0);
        assert_eq!(Complexity::of(&moderate), Complexity::Moderate);

        let complex = Task::new("t", "x", TaskType::Database).with_estimate(6.0);
        assert_eq!(Complexity::of(&complex), Complexity::Complex);

        let critical = Task::new("t", "x", TaskType::Deployment)
            .with_estimate(12.0)
            .with_priority(TaskPriority::Urgent);
        assert_eq!(Complexity::of(&critical), Complexity::Critical);
    }

    #[test]
    fn test_dependencies_raise_score() {
        let deps: Vec<String> = (0..4).map(|i| format!("d{i}")).collect();
        let t = Task::new("t", "x", TaskType::Backend)
            .with_estimate(3.0)
            .with_dependencies(deps);
        assert_eq!(Complexity::of(&t), Complexity::Moderate);
    }

    #[test]
    fn test_timeout_scaling() {
        let base = Duration::from_secs(300);
        assert_eq!(Complexity::Simple.timeout(base), base);
        assert_eq!(Complexity::Moderate.timeout(base), Duration::from_secs(450));
        assert_eq!(Complexity::Critical.timeout(base), Duration::from_secs(900));
    }
}
