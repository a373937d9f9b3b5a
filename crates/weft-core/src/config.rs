use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};

/// Top-level configuration loaded from `weft.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeftConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Graph engine limits and defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Executions allowed to run at once.
    #[serde(default = "default_max_concurrent_workflows")]
    pub max_concurrent_workflows: usize,
    /// Node timeout used when neither the node nor the workflow sets one.
    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,
    /// Whole-execution deadline. 0 disables it.
    #[serde(default = "default_workflow_timeout_ms")]
    pub workflow_timeout_ms: u64,
    /// Route task/parallel/loop nodes through the supervised coordinator.
    #[serde(default)]
    pub use_coordinator: bool,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: default_max_concurrent_workflows(),
            node_timeout_ms: default_node_timeout_ms(),
            workflow_timeout_ms: default_workflow_timeout_ms(),
            use_coordinator: false,
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn workflow_timeout(&self) -> Option<Duration> {
        (self.workflow_timeout_ms > 0).then(|| Duration::from_millis(self.workflow_timeout_ms))
    }
}

fn default_max_concurrent_workflows() -> usize { 100 }
fn default_node_timeout_ms() -> u64 { 300_000 }
fn default_workflow_timeout_ms() -> u64 { 7_200_000 }

/// Default retry policy for nodes without their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Extra attempts after the first failure.
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Actor coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Bounded mailbox size per worker.
    #[serde(default = "default_mailbox_size")]
    pub mailbox_size: usize,
    /// In-flight agent calls across all workers.
    #[serde(default = "default_max_concurrent_agents")]
    pub max_concurrent_agents: usize,
    /// Reply wait used when a request carries no timeout.
    #[serde(default = "default_node_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default)]
    pub supervision: SupervisionConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            mailbox_size: default_mailbox_size(),
            max_concurrent_agents: default_max_concurrent_agents(),
            default_timeout_ms: default_node_timeout_ms(),
            supervision: SupervisionConfig::default(),
        }
    }
}

fn default_mailbox_size() -> usize { 100 }
fn default_max_concurrent_agents() -> usize { 10 }

/// Restart budget for a crashing worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisionConfig {
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_window")]
    pub within_secs: u64,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            within_secs: default_restart_window(),
        }
    }
}

impl SupervisionConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.within_secs)
    }
}

fn default_max_restarts() -> u32 { 3 }
fn default_restart_window() -> u64 { 60 }

/// Event bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

fn default_event_capacity() -> usize { 256 }

/// Session history settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Runs kept per session.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Past runs exposed to pipeline steps.
    #[serde(default = "default_num_history_runs")]
    pub num_history_runs: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            num_history_runs: default_num_history_runs(),
        }
    }
}

fn default_history_limit() -> usize { 10 }
fn default_num_history_runs() -> usize { 3 }

impl WeftConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| WeftError::Config(e.to_string()))
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables stay verbatim
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}
