//! Mock agents, a mock factory, and fixtures shared by Weft tests.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use weft_core::error::{Result, WeftError};
use weft_core::traits::{AgentExecutor, AgentFactory};
use weft_core::types::{AgentEvent, AgentRef};

fn reply(content: impl Into<String>) -> BoxStream<'static, Result<AgentEvent>> {
    stream::iter([Ok(AgentEvent::message(content))]).boxed()
}

/// Replies with its input.
#[derive(Debug, Default)]
pub struct EchoAgent;

impl EchoAgent {
    pub fn new() -> Self {
        Self
    }
}

impl AgentExecutor for EchoAgent {
    fn name(&self) -> &str {
        "echo"
    }

    fn execute(&self, _cancel: CancellationToken, input: String) -> BoxStream<'static, Result<AgentEvent>> {
        reply(input)
    }
}

/// Replies with its input upper-cased.
#[derive(Debug, Default)]
pub struct UpperAgent;

impl AgentExecutor for UpperAgent {
    fn name(&self) -> &str {
        "upper"
    }

    fn execute(&self, _cancel: CancellationToken, input: String) -> BoxStream<'static, Result<AgentEvent>> {
        reply(input.to_uppercase())
    }
}

/// Replies with scripted responses in order, repeating the last one.
pub struct ScriptedAgent {
    responses: Vec<String>,
    next: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedAgent {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: responses.into_iter().map(String::from).collect(),
            next: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Wait before replying. Cancellation cuts the wait short.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.next.load(Ordering::SeqCst)
    }
}

impl AgentExecutor for ScriptedAgent {
    fn name(&self) -> &str {
        "scripted"
    }

    fn execute(&self, cancel: CancellationToken, _input: String) -> BoxStream<'static, Result<AgentEvent>> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let content = self
            .responses
            .get(n)
            .or_else(|| self.responses.last())
            .cloned()
            .unwrap_or_default();
        let delay = self.delay;
        stream::once(async move {
            if let Some(delay) = delay {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(WeftError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Ok(AgentEvent::message(content))
        })
        .boxed()
    }
}

/// Always fails with an agent error.
pub struct FailingAgent {
    message: String,
}

impl FailingAgent {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

impl AgentExecutor for FailingAgent {
    fn name(&self) -> &str {
        "failing"
    }

    fn execute(&self, _cancel: CancellationToken, _input: String) -> BoxStream<'static, Result<AgentEvent>> {
        let err = WeftError::Agent(self.message.clone());
        stream::once(async move { Err(err) }).boxed()
    }
}

/// Echoes after a delay, or stops early with `Cancelled`.
pub struct SlowAgent {
    delay: Duration,
}

impl SlowAgent {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl AgentExecutor for SlowAgent {
    fn name(&self) -> &str {
        "slow"
    }

    fn execute(&self, cancel: CancellationToken, input: String) -> BoxStream<'static, Result<AgentEvent>> {
        let delay = self.delay;
        stream::once(async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(WeftError::Cancelled),
                _ = tokio::time::sleep(delay) => Ok(AgentEvent::message(input)),
            }
        })
        .boxed()
    }
}

/// Panics on its first `n` calls, then replies `recovered: <input>`.
pub struct PanickingAgent {
    remaining: AtomicUsize,
}

impl PanickingAgent {
    pub fn new(panics: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(panics),
        }
    }
}

impl AgentExecutor for PanickingAgent {
    fn name(&self) -> &str {
        "panicking"
    }

    fn execute(&self, _cancel: CancellationToken, input: String) -> BoxStream<'static, Result<AgentEvent>> {
        let left = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if left.is_ok() {
            panic!("agent blew up on {input}");
        }
        reply(format!("recovered: {input}"))
    }
}

/// Fails with a retryable agent error `n` times, then echoes.
pub struct FlakyAgent {
    failures: AtomicUsize,
    calls: AtomicUsize,
}

impl FlakyAgent {
    pub fn new(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AgentExecutor for FlakyAgent {
    fn name(&self) -> &str {
        "flaky"
    }

    fn execute(&self, _cancel: CancellationToken, input: String) -> BoxStream<'static, Result<AgentEvent>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            let err = WeftError::Agent(format!("transient failure on call {call}"));
            return stream::once(async move { Err(err) }).boxed();
        }
        reply(input)
    }
}

/// Echoes and remembers every input it received.
#[derive(Default)]
pub struct RecordingAgent {
    inputs: Mutex<Vec<String>>,
}

impl RecordingAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inputs(&self) -> Vec<String> {
        self.inputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AgentExecutor for RecordingAgent {
    fn name(&self) -> &str {
        "recording"
    }

    fn execute(&self, _cancel: CancellationToken, input: String) -> BoxStream<'static, Result<AgentEvent>> {
        self.inputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(input.clone());
        reply(input)
    }
}

/// Resolves templates to pre-registered agents.
#[derive(Default)]
pub struct MockAgentFactory {
    agents: HashMap<String, Arc<dyn AgentExecutor>>,
    created: Arc<AtomicUsize>,
}

impl MockAgentFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent(mut self, template: &str, agent: Arc<dyn AgentExecutor>) -> Self {
        self.agents.insert(template.to_string(), agent);
        self
    }

    /// Counts successful `create_agent` calls.
    pub fn created_counter(&self) -> Arc<AtomicUsize> {
        self.created.clone()
    }
}

impl AgentFactory for MockAgentFactory {
    fn create_agent(
        &self,
        agent: &AgentRef,
        _config: &HashMap<String, serde_json::Value>,
    ) -> BoxFuture<'_, Result<Arc<dyn AgentExecutor>>> {
        let found = self.agents.get(&agent.template).cloned();
        let template = agent.template.clone();
        Box::pin(async move {
            let agent = found.ok_or(WeftError::AgentNotFound(template))?;
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(agent)
        })
    }
}

/// Fixtures shared by integration tests.
pub mod fixtures {
    use super::*;

    /// Document for `start -> task -> end` where the task runs `template` on
    /// the `message` input and the end node outputs `result`.
    pub fn linear_workflow_json(template: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "linear",
            "name": "Linear",
            "version": "1.0.0",
            "inputs": [{"name": "message", "type": "string", "required": true}],
            "outputs": [{"name": "result", "type": "string"}],
            "nodes": [
                {"id": "start", "name": "Start", "type": "start"},
                {
                    "id": "task",
                    "name": "Task",
                    "type": "task",
                    "agent": {
                        "template": template,
                        "inputs": {"message": "message"},
                        "outputs": {"result": "content"}
                    }
                },
                {"id": "end", "name": "End", "type": "end"}
            ],
            "edges": [
                {"id": "e1", "from": "start", "to": "task"},
                {"id": "e2", "from": "task", "to": "end"}
            ]
        })
    }

    /// Write `contents` to a temporary `.toml` file that lives as long as the
    /// returned handle.
    pub fn temp_config(contents: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("create temp config");
        tmp.write_all(contents.as_bytes()).expect("write temp config");
        tmp
    }
}
