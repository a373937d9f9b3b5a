use thiserror::Error;

#[derive(Debug, Error)]
pub enum WeftError {
    // Definition / input errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    // Node errors
    #[error("Node execution failed: {node_id} ({node_name}): {message}")]
    NodeExecution {
        node_id: String,
        node_name: String,
        message: String,
        retryable: bool,
    },

    #[error("Timeout after {timeout_ms}ms: {target}")]
    Timeout { target: String, timeout_ms: u64 },

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Condition evaluation failed: {0}")]
    ConditionEvaluation(String),

    // Step errors
    #[error("Step failed: {step}: {message}")]
    Step { step: String, message: String },

    #[error("Route not found: {0}")]
    RouteNotFound(String),

    // Agent errors
    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Agent template not found: {0}")]
    AgentNotFound(String),

    // Engine state errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WeftError {
    /// Build a node failure.
    pub fn node(
        node_id: impl Into<String>,
        node_name: impl Into<String>,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self::NodeExecution {
            node_id: node_id.into(),
            node_name: node_name.into(),
            message: message.into(),
            retryable,
        }
    }

    /// Whether a retry may succeed where this attempt failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NodeExecution { retryable, .. } => *retryable,
            Self::Timeout { .. } | Self::Agent(_) => true,
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Short kind label used in traces and events.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::WorkflowNotFound(_) => ErrorKind::Validation,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancellation,
            Self::ConditionEvaluation(_) => ErrorKind::ConditionEvaluation,
            _ => ErrorKind::NodeExecution,
        }
    }
}

/// Coarse classification of a [`WeftError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NodeExecution,
    Timeout,
    Cancellation,
    ConditionEvaluation,
}

pub type Result<T> = std::result::Result<T, WeftError>;
