use crate::{FleetError, FleetResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Category of work a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// UI work.
    Frontend,
    /// Server-side work.
    Backend,
    /// Database work.
    Database,
    /// Tests.
    Testing,
    /// Infrastructure.
    Devops,
    /// Documentation.
    Documentation,
    /// Refactoring.
    Refactoring,
    /// Debugging.
    Debugging,
    /// General development.
    Development,
    /// Investigation.
    Research,
    /// Release and rollout.
    Deployment,
    /// Code review.
    Review,
    /// Anything else.
    #[default]
    General,
}

impl TaskType {
    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Frontend => "frontend",
            TaskType::Backend => "backend",
            TaskType::Database => "database",
            TaskType::Testing => "testing",
            TaskType::Devops => "devops",
            TaskType::Documentation => "documentation",
            TaskType::Refactoring => "refactoring",
            TaskType::Debugging => "debugging",
            TaskType::Development => "development",
            TaskType::Research => "research",
            TaskType::Deployment => "deployment",
            TaskType::Review => "review",
            TaskType::General => "general",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority. Ordered `Low < Normal < High < Urgent`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Background work.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Ahead of normal work.
    High,
    /// Dispatched ahead of everything else.
    Urgent,
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::Normal => write!(f, "normal"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Urgent => write!(f, "urgent"),
        }
    }
}

/// A task that the dependency engine has already declared eligible to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task id.
    pub id: String,
    /// Short summary.
    pub title: String,
    /// Full instructions sent to the agent.
    #[serde(default)]
    pub description: String,
    /// Kind of work.
    #[serde(default, rename = "type")]
    pub task_type: TaskType,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: TaskPriority,
    /// Free-form labels; some raise complexity.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Estimated effort in hours.
    #[serde(default)]
    pub estimated_hours: Option<f64>,
    /// Ids of tasks this one depended on (already satisfied).
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Owning project, if any.
    #[serde(default)]
    pub project_id: Option<String>,
    /// Owning epic, if any.
    #[serde(default)]
    pub epic_id: Option<String>,
}

impl Task {
    /// Task with normal priority and no estimate.
    pub fn new(id: impl Into<String>, title: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            task_type,
            priority: TaskPriority::Normal,
            tags: Vec::new(),
            estimated_hours: None,
            dependencies: Vec::new(),
            project_id: None,
            epic_id: None,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the tags.
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Set the effort estimate in hours.
    pub fn with_estimate(mut self, hours: f64) -> Self {
        self.estimated_hours = Some(hours);
        self
    }

    /// Set the ids of tasks this one depends on.
    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Place the task in a project and optional epic.
    pub fn in_project(mut self, project_id: impl Into<String>, epic_id: Option<String>) -> Self {
        self.project_id = Some(project_id.into());
        self.epic_id = epic_id;
        self
    }

    /// Reject tasks without an id or title.
    pub fn validate(&self) -> FleetResult<()> {
        if self.id.trim().is_empty() {
            return Err(FleetError::Validation("task id must not be empty".into()));
        }
        if self.title.trim().is_empty() {
            return Err(FleetError::Validation(format!(
                "task '{}' has an empty title",
                self.id
            )));
        }
        Ok(())
    }
}

/// Project-level context that travels with a task to the agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectContext {
    /// Project id.
    pub project_id: String,
    /// Display name.
    #[serde(default)]
    pub project_name: Option<String>,
    /// Epic within the project.
    #[serde(default)]
    pub epic_id: Option<String>,
    /// Languages and frameworks in use.
    #[serde(default)]
    pub tech_stack: Vec<String>,
    /// Notes passed to the agent.
    #[serde(default)]
    pub notes: Option<String>,
    /// Opaque project metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ProjectContext {
    /// Context for `project_id` with nothing else set.
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ..Self::default()
        }
    }

    /// Set the epic id.
    pub fn with_epic(mut self, epic_id: impl Into<String>) -> Self {
        self.epic_id = Some(epic_id.into());
        self
    }

    /// The project a task belongs to: the task's own id wins over the context.
    pub fn effective_project<'a>(&'a self, task: &'a Task) -> &'a str {
        task.project_id.as_deref().unwrap_or(&self.project_id)
    }

    /// The epic a task belongs to, if any.
    pub fn effective_epic<'a>(&'a self, task: &'a Task) -> Option<&'a str> {
        task.epic_id.as_deref().or(self.epic_id.as_deref())
    }
}
