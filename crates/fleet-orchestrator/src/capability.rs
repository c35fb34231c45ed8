use fleet_core::{Capability, Task, TaskType};
use std::collections::{BTreeSet, HashSet};

/// Maps tasks onto agent capabilities.
///
/// The default [`KeywordMatcher`] is a fixed table; implement this trait to
/// swap in a different inference without touching selection or assignment.
pub trait CapabilityMatcher: Send + Sync {
    /// Capabilities that can handle `task_type`.
    fn whitelist(&self, task_type: TaskType) -> &[Capability];

    /// Words in a task's tags or description that suggest `capability`.
    fn keywords(&self, capability: Capability) -> &[&'static str];

    /// Whether an agent with `capabilities` can take `task`.
    fn is_match(&self, capabilities: &BTreeSet<Capability>, task: &Task) -> bool {
        if self
            .whitelist(task.task_type)
            .iter()
            .any(|c| capabilities.contains(c))
        {
            return true;
        }
        let words = task_words(task);
        capabilities.iter().any(|cap| {
            words.contains(cap.as_str()) || self.keywords(*cap).iter().any(|k| words.contains(*k))
        })
    }

    /// Relevance of `capabilities` to `task` in `[0, 100]`.
    ///
    /// +50 for a type match, +10 per tag naming one of the agent's
    /// capabilities or their keywords, +5 per distinct description keyword.
    fn relevance(&self, capabilities: &BTreeSet<Capability>, task: &Task) -> f64 {
        let mut score = 0.0;

        let type_match = match Capability::parse(task.task_type.as_str()) {
            Some(cap) => capabilities.contains(&cap),
            None => self
                .whitelist(task.task_type)
                .iter()
                .any(|c| capabilities.contains(c)),
        };
        if type_match {
            score += 50.0;
        }

        for tag in &task.tags {
            let tag = tag.trim().to_lowercase();
            let hit = capabilities
                .iter()
                .any(|cap| cap.as_str() == tag || self.keywords(*cap).contains(&tag.as_str()));
            if hit {
                score += 10.0;
            }
        }

        let description = tokenize(&format!("{} {}", task.title, task.description));
        let mut seen = HashSet::new();
        for cap in capabilities {
            for keyword in self.keywords(*cap) {
                if description.contains(*keyword) && seen.insert(*keyword) {
                    score += 5.0;
                }
            }
        }

        f64::min(score, 100.0)
    }
}

/// Lowercased alphanumeric words of `text`.
pub fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn task_words(task: &Task) -> HashSet<String> {
    let mut words = tokenize(&format!("{} {}", task.title, task.description));
    words.extend(task.tags.iter().map(|t| t.trim().to_lowercase()));
    words
}

/// Built-in type whitelist and keyword table.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordMatcher;

impl CapabilityMatcher for KeywordMatcher {
    fn whitelist(&self, task_type: TaskType) -> &[Capability] {
        use Capability::*;
        match task_type {
            TaskType::Frontend => &[Frontend, General],
            TaskType::Backend => &[Backend, General],
            TaskType::Database => &[Database, Backend],
            TaskType::Testing => &[Testing, Debugging, General],
            TaskType::Devops | TaskType::Deployment => &[Devops],
            TaskType::Documentation => &[Documentation, General],
            TaskType::Refactoring => &[Refactoring, Backend, Frontend],
            TaskType::Debugging => &[Debugging, Testing],
            TaskType::Development => &[Frontend, Backend, General],
            TaskType::Research => &[General, Documentation],
            TaskType::Review => &[Refactoring, Testing, General],
            TaskType::General => &[General],
        }
    }

    fn keywords(&self, capability: Capability) -> &[&'static str] {
        match capability {
            Capability::Frontend => &["ui", "react", "vue", "css", "html", "component", "frontend"],
            Capability::Backend => &["api", "server", "endpoint", "service", "rest", "graphql"],
            Capability::Database => &["sql", "schema", "migration", "query", "index", "postgres"],
            Capability::Testing => &["test", "tests", "coverage", "unit", "integration", "e2e"],
            Capability::Devops => &["deploy", "docker", "kubernetes", "ci", "pipeline", "infra"],
            Capability::Documentation => &["docs", "readme", "guide", "documentation", "tutorial"],
            Capability::Refactoring => &["refactor", "cleanup", "restructure", "simplify"],
            Capability::Debugging => &["bug", "fix", "crash", "error", "debug", "regression"],
            Capability::General => &[],
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn caps(list: &[Capability]) -> BTreeSet<Capability> {
        list.iter().copied().collect()
    }

    #[test]
    fn test_whitelist_match() {
        let m = KeywordMatcher;
        let task = Task::new("t1", "Build login", TaskType::Frontend);
        assert!(m.is_match(&caps(&[Capability::General]), &task));
        assert!(!m.is_match(&caps(&[Capability::Database]), &task));
    }

    #[test]
    fn test_keyword_match_outside_whitelist() {
        let m = KeywordMatcher;
        let task = Task::new("t1", "Write docs", TaskType::Documentation)
            .with_description("Document the Docker setup for CI");
        assert!(m.is_match(&caps(&[Capability::Devops]), &task));
    }

    #[test]
    fn test_tag_names_capability() {
        let m = KeywordMatcher;
        let task = Task::new("t1", "Investigate", TaskType::Research).with_tags(vec!["database".into()]);
        assert!(m.is_match(&caps(&[Capability::Database]), &task));
    }

    #[test]
    fn test_relevance_components() {
        let m = KeywordMatcher;
        let task = Task::new("t1", "Checkout page", TaskType::Frontend)
            .with_description("React component with CSS grid")
            .with_tags(vec!["ui".into(), "payments".into()]);

        // type +50, tag "ui" +10, keywords react/component/css +15
        let score = m.relevance(&caps(&[Capability::Frontend]), &task);
        assert!((score - 75.0).abs() < f64::EPSILON, "{score}");

        let unrelated = m.relevance(&caps(&[Capability::Database]), &task);
        assert_eq!(unrelated, 0.0);
    }

    #[test]
    fn test_relevance_capped() {
        let m = KeywordMatcher;
        let task = Task::new("t1", "ui react vue css html component frontend", TaskType::Frontend)
            .with_tags(vec!["ui".into(), "react".into(), "vue".into(), "css".into(), "html".into()]);
        assert_eq!(m.relevance(&caps(&[Capability::Frontend]), &task), 100.0);
    }

    #[test]
    fn test_tokenize_splits_punctuation() {
        let words = tokenize("Fix: API-crash (v2)");
        assert!(words.contains("api"));
        assert!(words.contains("crash"));
        assert!(words.contains("v2"));
    }
}
