use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::traits::{collect_content, AgentExecutor};

use super::{Step, StepConfig, StepInput, StepKind, StepMeta, StepOutput};

/// Delegates to an agent and captures its final text as the content.
///
/// A room step is the same delegation to a multi-agent executor; only the
/// reported kind differs.
pub struct AgentStep {
    meta: StepMeta,
    kind: StepKind,
    agent: Arc<dyn AgentExecutor>,
}

impl AgentStep {
    pub fn new(name: impl Into<String>, agent: Arc<dyn AgentExecutor>) -> Self {
        Self {
            meta: StepMeta::new(name),
            kind: StepKind::Agent,
            agent,
        }
    }

    pub fn room(name: impl Into<String>, room: Arc<dyn AgentExecutor>) -> Self {
        Self {
            kind: StepKind::Room,
            ..Self::new(name, room)
        }
    }

    pub fn with_config(mut self, config: StepConfig) -> Self {
        self.meta.config = config;
        self
    }
}

impl Step for AgentStep {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn name(&self) -> &str {
        &self.meta.name
    }

    fn kind(&self) -> StepKind {
        self.kind
    }

    fn config(&self) -> &StepConfig {
        &self.meta.config
    }

    fn execute(&self, cancel: CancellationToken, input: StepInput) -> BoxStream<'_, Result<StepOutput>> {
        stream::once(async move {
            let started = StepOutput::begin(self);
            let message = input.message();
            debug!(step = %self.meta.name, agent = %self.agent.name(), "Delegating to agent");

            let events = self.agent.execute(cancel.clone(), message);
            let output = collect_content(events, &cancel).await.map_err(|e| match e {
                WeftError::Cancelled | WeftError::Timeout { .. } => e,
                other => WeftError::Step {
                    step: self.meta.name.clone(),
                    message: other.to_string(),
                },
            })?;

            let mut out = started
                .with_content(output.content)
                .with_metadata("agent", json!(self.agent.name()))
                .with_metadata("event_count", json!(output.event_count));
            out.metadata.extend(output.metadata);
            Ok(out.finish())
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::run_step;
    use weft_test_utils::{EchoAgent, FailingAgent};

    #[tokio::test]
    async fn test_agent_content_becomes_output() {
        let step = AgentStep::new("echo", Arc::new(EchoAgent::new()));
        let out = run_step(&step, &CancellationToken::new(), StepInput::new("hello"))
            .await
            .unwrap();
        assert_eq!(out.content, json!("hello"));
        assert_eq!(out.metadata["agent"], json!("echo"));
    }

    #[tokio::test]
    async fn test_room_reports_room_kind() {
        let step = AgentStep::room("panel", Arc::new(EchoAgent::new()));
        let mut input = StepInput::new(serde_json::Value::Null);
        input.previous_step_content = Some(json!("from before"));
        let out = run_step(&step, &CancellationToken::new(), input).await.unwrap();
        assert_eq!(out.step_kind, StepKind::Room);
        assert_eq!(out.content, json!("from before"));
    }

    #[tokio::test]
    async fn test_agent_failure_is_a_step_error() {
        let step = AgentStep::new("bad", Arc::new(FailingAgent::new("boom")));
        let err = run_step(&step, &CancellationToken::new(), StepInput::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::Step { ref step, .. } if step == "bad"));
    }
}
