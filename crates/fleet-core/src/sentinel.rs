//! The Sentinel protocol boundary.
//!
//! The orchestrator never looks inside a task payload or an agent reply beyond
//! the fields of [`AgentResponse`]. Everything else is owned by an
//! implementation of [`SentinelProtocol`]; [`TextSentinel`] is the default one.

use crate::task::{ProjectContext, Task};
use crate::{FleetError, FleetResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const TASK_HEADER: &str = "### SENTINEL TASK v1";
const TASK_FOOTER: &str = "### END SENTINEL TASK";

/// Status an agent reports for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    /// Task finished.
    Done,
    /// Work continues; may carry a progress percentage.
    InProgress,
    /// Task failed.
    Failed,
    /// Agent needs input to continue.
    Help,
    /// Agent is blocked on something external.
    Blocked,
}

impl ResponseStatus {
    /// Parse a status keyword. Accepts a few common synonyms.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().replace(&[' ', '-'][..], "_").as_str() {
            "DONE" | "COMPLETED" | "COMPLETE" => Some(ResponseStatus::Done),
            "IN_PROGRESS" | "PROGRESS" | "WORKING" => Some(ResponseStatus::InProgress),
            "FAILED" | "FAILURE" | "ERROR" => Some(ResponseStatus::Failed),
            "HELP" | "NEEDS_HELP" => Some(ResponseStatus::Help),
            "BLOCKED" => Some(ResponseStatus::Blocked),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseStatus::Done => write!(f, "DONE"),
            ResponseStatus::InProgress => write!(f, "IN_PROGRESS"),
            ResponseStatus::Failed => write!(f, "FAILED"),
            ResponseStatus::Help => write!(f, "HELP"),
            ResponseStatus::Blocked => write!(f, "BLOCKED"),
        }
    }
}

/// A decoded agent reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    /// Task the response refers to.
    pub task_id: String,
    /// Reported status.
    pub status: ResponseStatus,
    /// Free-form message line.
    #[serde(default)]
    pub message: Option<String>,
    /// `PROGRESS:` percentage, clamped to 100.
    #[serde(default)]
    pub progress_percentage: Option<u8>,
    /// `COMPLETED:` details.
    #[serde(default)]
    pub completion_details: Option<String>,
    /// `HELP:` request text.
    #[serde(default)]
    pub help_request: Option<String>,
    /// `BLOCKER:` details.
    #[serde(default)]
    pub blocker_details: Option<String>,
}

impl AgentResponse {
    /// Response with no optional fields set.
    pub fn new(task_id: impl Into<String>, status: ResponseStatus) -> Self {
        Self {
            task_id: task_id.into(),
            status,
            message: None,
            progress_percentage: None,
            completion_details: None,
            help_request: None,
            blocker_details: None,
        }
    }

    /// The most specific human-readable explanation the agent gave.
    pub fn reason(&self) -> Option<&str> {
        match self.status {
            ResponseStatus::Help => self.help_request.as_deref().or(self.message.as_deref()),
            ResponseStatus::Blocked => self.blocker_details.as_deref().or(self.message.as_deref()),
            ResponseStatus::Done => self
                .completion_details
                .as_deref()
                .or(self.message.as_deref()),
            _ => self.message.as_deref(),
        }
    }

    /// Render this response in the line format [`TextSentinel`] parses.
    pub fn to_text(&self) -> String {
        let mut out = format!("TASK_ID: {}\nSTATUS: {}\n", self.task_id, self.status);
        let optional = [
            ("MESSAGE", self.message.as_deref()),
            ("DETAILS", self.completion_details.as_deref()),
            ("HELP", self.help_request.as_deref()),
            ("BLOCKER", self.blocker_details.as_deref()),
        ];
        if let Some(p) = self.progress_percentage {
            out.push_str(&format!("PROGRESS: {p}\n"));
        }
        for (key, value) in optional {
            if let Some(v) = value {
                out.push_str(&format!("{key}: {v}\n"));
            }
        }
        out
    }
}

/// Encode tasks for agents and decode their replies.
pub trait SentinelProtocol: Send + Sync {
    /// Turn a task into the text an agent receives.
    fn format_task(
        &self,
        task: &Task,
        context: &ProjectContext,
        epic_title: Option<&str>,
    ) -> FleetResult<String>;

    /// Decode an agent reply. `expected_task_id` fills in a missing task id.
    fn parse_response(
        &self,
        raw: &str,
        expected_task_id: Option<&str>,
    ) -> FleetResult<AgentResponse>;
}

/// Default line-oriented Sentinel codec.
///
/// Tasks are rendered as a delimited block of `KEY: value` headers followed by
/// the description. Replies are accepted either as `KEY: value` lines or as a
/// JSON object with the [`AgentResponse`] field names.
#[derive(Debug, Clone, Default)]
pub struct TextSentinel;

impl TextSentinel {
    /// Protocol with the default markers.
    pub fn new() -> Self {
        Self
    }

    fn parse_lines(raw: &str) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        for line in raw.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_uppercase().replace(&[' ', '-'][..], "_");
            if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphabetic() || c == '_') {
                continue;
            }
            // First occurrence wins so quoted replies further down cannot override.
            fields
                .entry(key)
                .or_insert_with(|| value.trim().to_string());
        }
        fields
    }

    fn parse_progress(value: &str) -> Option<u8> {
        let digits = value.trim().trim_end_matches('%').trim();
        digits.parse::<f64>().ok().map(|p| p.clamp(0.0, 100.0) as u8)
    }
}

impl SentinelProtocol for TextSentinel {
    fn format_task(
        &self,
        task: &Task,
        context: &ProjectContext,
        epic_title: Option<&str>,
    ) -> FleetResult<String> {
        if task.id.contains(&['\n', '\r'][..]) || task.title.contains(&['\n', '\r'][..]) {
            return Err(FleetError::Protocol(format!(
                "task '{}' has a multi-line id or title",
                task.id.escape_debug()
            )));
        }

        let mut out = String::new();
        out.push_str(TASK_HEADER);
        out.push('\n');
        out.push_str(&format!("TASK_ID: {}\n", task.id));
        out.push_str(&format!("TITLE: {}\n", task.title));
        out.push_str(&format!("TYPE: {}\n", task.task_type));
        out.push_str(&format!("PRIORITY: {}\n", task.priority));
        out.push_str(&format!("PROJECT: {}\n", context.effective_project(task)));
        if let Some(name) = &context.project_name {
            out.push_str(&format!("PROJECT_NAME: {name}\n"));
        }
        match (context.effective_epic(task), epic_title) {
            (Some(id), Some(title)) => out.push_str(&format!("EPIC: {title} ({id})\n")),
            (Some(id), None) => out.push_str(&format!("EPIC: {id}\n")),
            (None, Some(title)) => out.push_str(&format!("EPIC: {title}\n")),
            (None, None) => {}
        }
        if !task.tags.is_empty() {
            out.push_str(&format!("TAGS: {}\n", task.tags.join(", ")));
        }
        if let Some(hours) = task.estimated_hours {
            out.push_str(&format!("ESTIMATED_HOURS: {hours}\n"));
        }
        if !task.dependencies.is_empty() {
            out.push_str(&format!("DEPENDENCIES: {}\n", task.dependencies.join(", ")));
        }
        if !context.tech_stack.is_empty() {
            out.push_str(&format!("TECH_STACK: {}\n", context.tech_stack.join(", ")));
        }
        out.push_str("--- DESCRIPTION ---\n");
        if task.description.is_empty() {
            out.push_str(&task.title);
        } else {
            out.push_str(&task.description);
        }
        out.push('\n');
        if let Some(notes) = &context.notes {
            out.push_str("--- NOTES ---\n");
            out.push_str(notes);
            out.push('\n');
        }
        out.push_str("--- RESPONSE FORMAT ---\n");
        out.push_str("Reply with `TASK_ID: <id>` and `STATUS: DONE|IN_PROGRESS|FAILED|HELP|BLOCKED`,\n");
        out.push_str("optionally followed by MESSAGE, PROGRESS, DETAILS, HELP or BLOCKER lines.\n");
        out.push_str(TASK_FOOTER);
        Ok(out)
    }

    fn parse_response(
        &self,
        raw: &str,
        expected_task_id: Option<&str>,
    ) -> FleetResult<AgentResponse> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(FleetError::Protocol("empty agent response".into()));
        }

        if trimmed.starts_with('{') {
            #[derive(Deserialize)]
            struct JsonReply {
                #[serde(default)]
                task_id: Option<String>,
                status: String,
                #[serde(default)]
                message: Option<String>,
                #[serde(default)]
                progress_percentage: Option<f64>,
                #[serde(default)]
                completion_details: Option<String>,
                #[serde(default)]
                help_request: Option<String>,
                #[serde(default)]
                blocker_details: Option<String>,
            }

            let reply: JsonReply = serde_json::from_str(trimmed)?;
            let status = ResponseStatus::parse(&reply.status).ok_or_else(|| {
                FleetError::Protocol(format!("unknown response status '{}'", reply.status))
            })?;
            let task_id = reply
                .task_id
                .or_else(|| expected_task_id.map(str::to_string))
                .ok_or_else(|| FleetError::Protocol("response carries no task id".into()))?;
            return Ok(AgentResponse {
                task_id,
                status,
                message: reply.message,
                progress_percentage: reply
                    .progress_percentage
                    .map(|p| p.clamp(0.0, 100.0) as u8),
                completion_details: reply.completion_details,
                help_request: reply.help_request,
                blocker_details: reply.blocker_details,
            });
        }

        let fields = Self::parse_lines(trimmed);
        let status_raw = fields
            .get("STATUS")
            .ok_or_else(|| FleetError::Protocol("response has no STATUS line".into()))?;
        let status = ResponseStatus::parse(status_raw).ok_or_else(|| {
            FleetError::Protocol(format!("unknown response status '{status_raw}'"))
        })?;
        let task_id = fields
            .get("TASK_ID")
            .filter(|id| !id.is_empty())
            .cloned()
            .or_else(|| expected_task_id.map(str::to_string))
            .ok_or_else(|| FleetError::Protocol("response carries no task id".into()))?;

        let take = |key: &str| fields.get(key).filter(|v| !v.is_empty()).cloned();
        Ok(AgentResponse {
            task_id,
            status,
            message: take("MESSAGE"),
            progress_percentage: fields.get("PROGRESS").and_then(|p| Self::parse_progress(p)),
            completion_details: take("DETAILS").or_else(|| take("COMPLETION_DETAILS")),
            help_request: take("HELP").or_else(|| take("HELP_REQUEST")),
            blocker_details: take("BLOCKER").or_else(|| take("BLOCKER_DETAILS")),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::task::{TaskPriority, TaskType};

    fn task() -> Task {
        Task::new("t-42", "Build login form", TaskType::Frontend)
            .with_description("React form with validation")
            .with_priority(TaskPriority::High)
            .with_tags(vec!["react".into(), "auth".into()])
    }

    #[test]
    fn test_format_task_contains_headers() {
        let ctx = ProjectContext::new("shop").with_epic("e-1");
        let out = TextSentinel::new()
            .format_task(&task(), &ctx, Some("Accounts"))
            .unwrap();
        assert!(out.starts_with(TASK_HEADER));
        assert!(out.ends_with(TASK_FOOTER));
        assert!(out.contains("TASK_ID: t-42"));
        assert!(out.contains("PRIORITY: high"));
        assert!(out.contains("EPIC: Accounts (e-1)"));
        assert!(out.contains("TAGS: react, auth"));
        assert!(out.contains("React form with validation"));
    }

    #[test]
    fn test_format_rejects_multiline_title() {
        let mut t = task();
        t.title = "line one\nline two".into();
        let err = TextSentinel::new()
            .format_task(&t, &ProjectContext::new("p"), None)
            .unwrap_err();
        assert!(matches!(err, FleetError::Protocol(_)));
    }

    #[test]
    fn test_parse_line_response() {
        let raw = "TASK_ID: t-42\nSTATUS: in progress\nPROGRESS: 40%\nMESSAGE: halfway";
        let resp = TextSentinel::new().parse_response(raw, None).unwrap();
        assert_eq!(resp.task_id, "t-42");
        assert_eq!(resp.status, ResponseStatus::InProgress);
        assert_eq!(resp.progress_percentage, Some(40));
        assert_eq!(resp.message.as_deref(), Some("halfway"));
    }

    #[test]
    fn test_parse_uses_expected_task_id() {
        let resp = TextSentinel::new()
            .parse_response("STATUS: BLOCKED\nBLOCKER: missing credentials", Some("t-1"))
            .unwrap();
        assert_eq!(resp.task_id, "t-1");
        assert_eq!(resp.reason(), Some("missing credentials"));
    }

    #[test]
    fn test_parse_json_response() {
        let raw = r#"{"task_id":"t-9","status":"done","completion_details":"merged"}"#;
        let resp = TextSentinel::new().parse_response(raw, None).unwrap();
        assert_eq!(resp.status, ResponseStatus::Done);
        assert_eq!(resp.reason(), Some("merged"));
    }

    #[test]
    fn test_parse_rejects_missing_status() {
        let err = TextSentinel::new()
            .parse_response("TASK_ID: t-1\nMESSAGE: hi", None)
            .unwrap_err();
        assert!(matches!(err, FleetError::Protocol(_)));
        assert!(TextSentinel::new().parse_response("   ", None).is_err());
    }

    #[test]
    fn test_response_to_text_parses_back() {
        let mut resp = AgentResponse::new("t-3", ResponseStatus::Help);
        resp.help_request = Some("which database?".into());
        let parsed = TextSentinel::new()
            .parse_response(&resp.to_text(), None)
            .unwrap();
        assert_eq!(parsed, resp);
    }
}
