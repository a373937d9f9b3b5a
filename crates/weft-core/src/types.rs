use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique session identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generate a fresh execution / run identifier.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Lifecycle status shared by graph executions, pipeline runs, nodes and steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    Skipped,
}

impl RunStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout | Self::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of an event emitted by an agent executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentEventKind {
    /// Partial or final output text.
    Message,
    /// Progress report; content may be empty.
    Progress,
    /// Orchestration notice (e.g. which branch was selected).
    System,
    /// Non-fatal error report. Never taken as the result content.
    Error,
}

/// One event in an agent's output sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub kind: AgentEventKind,
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AgentEvent {
    pub fn message(content: impl Into<String>) -> Self {
        Self {
            kind: AgentEventKind::Message,
            content: content.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            kind: AgentEventKind::System,
            content: content.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            kind: AgentEventKind::Error,
            content: content.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Scalar result derived from an agent's event sequence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentOutput {
    pub content: String,
    pub event_count: usize,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Reference to an externally constructed agent.
///
/// `inputs` maps message keys to variable paths; `outputs` maps variable
/// names to keys of the agent's output (`content` or a metadata key).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentRef {
    #[serde(default)]
    pub id: String,
    pub template: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub config: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<String, String>,
}

impl AgentRef {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Map a message key to a variable path.
    pub fn with_input(mut self, key: impl Into<String>, variable: impl Into<String>) -> Self {
        self.inputs.insert(key.into(), variable.into());
        self
    }

    /// Store an output key into a variable after the agent finishes.
    pub fn with_output(mut self, variable: impl Into<String>, key: impl Into<String>) -> Self {
        self.outputs.insert(variable.into(), key.into());
        self
    }
}

/// Kind of attached media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    File,
}

/// Reference to media attached to a step input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Record of one finished run kept in a session's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: String,
    pub session_id: SessionId,
    pub workflow_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Session-scoped state plus a bounded run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSession {
    pub id: SessionId,
    pub workflow_id: String,
    #[serde(default)]
    pub state: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub history: VecDeque<WorkflowRun>,
    pub history_limit: usize,
    pub closed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowSession {
    pub fn new(workflow_id: impl Into<String>, history_limit: usize) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            workflow_id: workflow_id.into(),
            state: HashMap::new(),
            history: VecDeque::new(),
            history_limit,
            closed: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a run, evicting the oldest once the limit is reached.
    pub fn record_run(&mut self, run: WorkflowRun) {
        if self.history_limit == 0 {
            return;
        }
        while self.history.len() >= self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(run);
        self.updated_at = Utc::now();
    }

    /// The most recent `n` runs, oldest first.
    pub fn recent_runs(&self, n: usize) -> Vec<&WorkflowRun> {
        let skip = self.history.len().saturating_sub(n);
        self.history.iter().skip(skip).collect()
    }

    pub fn last_output(&self) -> Option<&serde_json::Value> {
        self.history.back().map(|r| &r.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(workflow: &str, n: u64) -> WorkflowRun {
        let now = Utc::now();
        WorkflowRun {
            run_id: new_id(),
            session_id: SessionId::new(),
            workflow_id: workflow.into(),
            status: RunStatus::Completed,
            input: serde_json::json!(n),
            output: serde_json::json!(n * 10),
            error: None,
            started_at: now,
            ended_at: now,
            duration_ms: n,
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let mut session = WorkflowSession::new("wf", 2);
        session.record_run(run("wf", 1));
        session.record_run(run("wf", 2));
        session.record_run(run("wf", 3));

        assert_eq!(session.history.len(), 2);
        assert_eq!(session.history[0].input, serde_json::json!(2));
        assert_eq!(session.last_output(), Some(&serde_json::json!(30)));
    }

    #[test]
    fn test_recent_runs_oldest_first() {
        let mut session = WorkflowSession::new("wf", 10);
        for i in 1..=4 {
            session.record_run(run("wf", i));
        }
        let recent = session.recent_runs(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].input, serde_json::json!(3));
        assert_eq!(recent[1].input, serde_json::json!(4));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Timeout.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert_eq!(RunStatus::Cancelled.to_string(), "cancelled");
    }
}
