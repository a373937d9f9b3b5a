//! Composable steps for linear pipelines.
//!
//! A [`Step`] yields a lazy sequence of [`StepOutput`]s; the last one is the
//! step's result. Composite steps (condition, loop, parallel, routers,
//! groups) drive their children through [`run_step`], which applies each
//! child's retry, timeout and skip settings.

mod agent;
mod condition;
mod function;
mod group;
mod loop_step;
mod parallel;
mod router;

pub use agent::AgentStep;
pub use condition::ConditionStep;
pub use function::FunctionStep;
pub use group::StepsGroup;
pub use loop_step::LoopStep;
pub use parallel::ParallelStep;
pub use router::{Router, RouterStep};

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use weft_core::error::{Result, WeftError};
use weft_core::types::{new_id, MediaRef};

use crate::graph::variables::value_to_text;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Function,
    Agent,
    Room,
    Condition,
    Loop,
    Parallel,
    Router,
    Steps,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Agent => "agent",
            Self::Room => "room",
            Self::Condition => "condition",
            Self::Loop => "loop",
            Self::Parallel => "parallel",
            Self::Router => "router",
            Self::Steps => "steps",
        }
    }
}

/// Per-step execution settings.
#[derive(Debug, Clone, Default)]
pub struct StepConfig {
    /// Extra attempts after the first failure.
    pub max_retries: u32,
    /// Applied to each attempt.
    pub timeout: Option<Duration>,
    /// Turn a final failure into a skipped output.
    pub skip_on_error: bool,
}

impl StepConfig {
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn skip_on_error(mut self) -> Self {
        self.skip_on_error = true;
        self
    }
}

/// Everything a step sees when it runs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StepInput {
    pub input: Value,
    pub previous_step_content: Option<Value>,
    /// Outputs of earlier steps, keyed by step name.
    pub previous_step_outputs: HashMap<String, StepOutput>,
    pub session_state: HashMap<String, Value>,
    pub additional_data: HashMap<String, Value>,
    pub media: Vec<MediaRef>,
}

impl StepInput {
    pub fn new(input: impl Into<Value>) -> Self {
        Self {
            input: input.into(),
            ..Default::default()
        }
    }

    pub fn with_session_state(mut self, state: HashMap<String, Value>) -> Self {
        self.session_state = state;
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.additional_data.insert(key.into(), value);
        self
    }

    pub fn with_media(mut self, media: MediaRef) -> Self {
        self.media.push(media);
        self
    }

    /// The message an agent receives: the input when it is text, else the
    /// previous step's content, else the input as JSON.
    pub fn message(&self) -> String {
        match &self.input {
            Value::String(s) if !s.is_empty() => s.clone(),
            other => match &self.previous_step_content {
                Some(prev) if !prev.is_null() => value_to_text(prev),
                _ => value_to_text(other),
            },
        }
    }

    /// The previous content if any, else the raw input.
    pub fn current(&self) -> &Value {
        match &self.previous_step_content {
            Some(prev) if !prev.is_null() => prev,
            _ => &self.input,
        }
    }

    pub fn step_output(&self, name: &str) -> Option<&StepOutput> {
        self.previous_step_outputs.get(name)
    }

    pub fn step_content(&self, name: &str) -> Option<&Value> {
        self.step_output(name).map(|o| &o.content)
    }

    /// Input for the step that follows `previous`.
    pub fn chained(&self, previous: &StepOutput) -> Self {
        let mut next = self.clone();
        next.previous_step_content = Some(previous.content.clone());
        next.previous_step_outputs
            .insert(previous.step_name.clone(), previous.clone());
        next
    }
}

/// Result of one step run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutput {
    pub step_id: String,
    pub step_name: String,
    pub step_kind: StepKind,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nested: Vec<StepOutput>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default)]
    pub skipped: bool,
}

impl StepOutput {
    /// Start an output for `step`, timestamped now.
    pub fn begin(step: &(impl Step + ?Sized)) -> Self {
        let now = Utc::now();
        Self {
            step_id: step.id().to_string(),
            step_name: step.name().to_string(),
            step_kind: step.kind(),
            content: Value::Null,
            error: None,
            metadata: HashMap::new(),
            nested: Vec::new(),
            started_at: now,
            ended_at: now,
            duration_ms: 0,
            skipped: false,
        }
    }

    pub fn with_content(mut self, content: impl Into<Value>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_nested(mut self, nested: Vec<StepOutput>) -> Self {
        self.nested = nested;
        self
    }

    /// Stamp the end time.
    pub fn finish(mut self) -> Self {
        self.ended_at = Utc::now();
        self.duration_ms = (self.ended_at - self.started_at).num_milliseconds().max(0) as u64;
        self
    }

    fn skipped(step: &(impl Step + ?Sized), err: &WeftError) -> Self {
        let mut out = Self::begin(step).finish();
        out.error = Some(err.to_string());
        out.skipped = true;
        out
    }

    pub fn content_text(&self) -> String {
        value_to_text(&self.content)
    }
}

/// A unit of pipeline work.
pub trait Step: Send + Sync + 'static {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn kind(&self) -> StepKind;
    fn config(&self) -> &StepConfig;

    /// Produce the step's output sequence. An `Err` item ends it as a failure.
    fn execute(&self, cancel: CancellationToken, input: StepInput) -> BoxStream<'_, Result<StepOutput>>;
}

/// Identity and settings shared by every step type.
#[derive(Debug, Clone)]
pub(crate) struct StepMeta {
    pub id: String,
    pub name: String,
    pub config: StepConfig,
}

impl StepMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            config: StepConfig::default(),
        }
    }
}

/// Drain a step's sequence down to its last output.
async fn drain(step: &dyn Step, cancel: &CancellationToken, input: StepInput) -> Result<StepOutput> {
    let mut stream = step.execute(cancel.clone(), input);
    let mut last = None;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WeftError::Cancelled),
            next = stream.next() => next,
        };
        match next {
            Some(Ok(out)) => last = Some(out),
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }
    last.ok_or_else(|| WeftError::Step {
        step: step.name().to_string(),
        message: "step produced no output".into(),
    })
}

/// Run a step under its own config: per-attempt timeout, `max_retries` extra
/// attempts, and `skip_on_error` turning the final failure into a skipped
/// output. Cancellation is never retried or skipped.
pub async fn run_step(step: &dyn Step, cancel: &CancellationToken, input: StepInput) -> Result<StepOutput> {
    let config = step.config();
    let attempts = config.max_retries + 1;
    let mut attempt = 0;

    let err = loop {
        attempt += 1;
        let result = match config.timeout {
            Some(limit) => tokio::time::timeout(limit, drain(step, cancel, input.clone()))
                .await
                .unwrap_or_else(|_| {
                    Err(WeftError::Timeout {
                        target: format!("step {}", step.name()),
                        timeout_ms: limit.as_millis() as u64,
                    })
                }),
            None => drain(step, cancel, input.clone()).await,
        };
        match result {
            Ok(out) => return Ok(out),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) if attempt < attempts => {
                warn!(step = %step.name(), attempt, error = %e, "Step failed, retrying");
            }
            Err(e) => break e,
        }
    };

    if config.skip_on_error {
        warn!(step = %step.name(), error = %err, "Step failed, skipping");
        return Ok(StepOutput::skipped(step, &err));
    }
    Err(err)
}
