//! Agent templates available to workflows run from the command line.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use weft_core::error::{Result, WeftError};
use weft_core::traits::{AgentExecutor, AgentFactory};
use weft_core::types::{AgentEvent, AgentRef};

pub const TEMPLATES: &[&str] = &["echo", "upper", "json"];

/// Resolves the `echo`, `upper` and `json` templates.
#[derive(Debug, Default)]
pub struct BuiltinAgents;

impl AgentFactory for BuiltinAgents {
    fn create_agent(
        &self,
        agent: &AgentRef,
        config: &HashMap<String, Value>,
    ) -> BoxFuture<'_, Result<Arc<dyn AgentExecutor>>> {
        let prefix = config
            .get("prefix")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let created: Result<Arc<dyn AgentExecutor>> = match agent.template.as_str() {
            "echo" => Ok(Arc::new(Echo { prefix })),
            "upper" => Ok(Arc::new(Upper)),
            "json" => Ok(Arc::new(JsonSummary)),
            other => Err(WeftError::AgentNotFound(other.to_string())),
        };
        Box::pin(async move { created })
    }
}

/// Replies with its input, optionally prefixed (`config.prefix`).
struct Echo {
    prefix: String,
}

impl AgentExecutor for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn execute(&self, _cancel: CancellationToken, input: String) -> BoxStream<'static, Result<AgentEvent>> {
        let text = format!("{}{}", self.prefix, input);
        stream::iter([Ok(AgentEvent::message(text))]).boxed()
    }
}

struct Upper;

impl AgentExecutor for Upper {
    fn name(&self) -> &str {
        "upper"
    }

    fn execute(&self, _cancel: CancellationToken, input: String) -> BoxStream<'static, Result<AgentEvent>> {
        stream::iter([Ok(AgentEvent::message(input.to_uppercase()))]).boxed()
    }
}

/// Describes its input as a JSON object. The fields are also attached as
/// metadata so node outputs can map them individually.
struct JsonSummary;

impl AgentExecutor for JsonSummary {
    fn name(&self) -> &str {
        "json"
    }

    fn execute(&self, _cancel: CancellationToken, input: String) -> BoxStream<'static, Result<AgentEvent>> {
        let words = input.split_whitespace().count();
        let chars = input.chars().count();
        let summary = json!({ "text": input, "words": words, "chars": chars });
        let event = AgentEvent::message(summary.to_string())
            .with_metadata("text", summary["text"].clone())
            .with_metadata("words", json!(words))
            .with_metadata("chars", json!(chars));
        stream::iter([Ok(AgentEvent::system("summarizing input")), Ok(event)]).boxed()
    }
}
