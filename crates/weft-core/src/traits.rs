use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, WeftError};
use crate::types::*;

/// Agent executor: the opaque unit of delegated work.
///
/// The returned stream owns everything it needs so it can be driven from a
/// spawned worker. An `Err` item terminates the sequence as a failure.
pub trait AgentExecutor: Send + Sync + 'static {
    /// Agent name, used in logs and traces.
    fn name(&self) -> &str;

    /// Run the agent on an input message.
    fn execute(
        &self,
        cancel: CancellationToken,
        input: String,
    ) -> BoxStream<'static, Result<AgentEvent>>;
}

/// Agent factory. Resolves an [`AgentRef`] into a runnable executor.
pub trait AgentFactory: Send + Sync + 'static {
    fn create_agent(
        &self,
        agent: &AgentRef,
        config: &HashMap<String, serde_json::Value>,
    ) -> BoxFuture<'_, Result<Arc<dyn AgentExecutor>>>;
}

/// Session store: persistence backend for workflow sessions.
pub trait SessionStore: Send + Sync + 'static {
    /// Open a new session for a workflow.
    fn create_session(&self, workflow_id: &str) -> BoxFuture<'_, Result<WorkflowSession>>;

    /// Fetch a session by id.
    fn get_session(&self, id: &SessionId) -> BoxFuture<'_, Result<Option<WorkflowSession>>>;

    /// Persist an updated session.
    fn save_session(&self, session: WorkflowSession) -> BoxFuture<'_, Result<()>>;

    /// Mark a session closed. Closing twice is not an error.
    fn close_session(&self, id: &SessionId) -> BoxFuture<'_, Result<()>>;

    /// Reuse the latest open session for a workflow, or create one.
    fn get_or_create_session(&self, workflow_id: &str) -> BoxFuture<'_, Result<WorkflowSession>>;
}

/// Drain an agent's event stream into its scalar result.
///
/// The content is the last non-error event carrying text. A failed item or
/// cancellation aborts collection.
pub async fn collect_content(
    mut stream: BoxStream<'static, Result<AgentEvent>>,
    cancel: &CancellationToken,
) -> Result<AgentOutput> {
    let mut output = AgentOutput::default();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(WeftError::Cancelled),
            next = stream.next() => next,
        };
        let Some(event) = next else { break };
        let event = event?;
        output.event_count += 1;
        if event.kind == AgentEventKind::Error {
            tracing::debug!(error = %event.content, "Agent reported a non-fatal error");
            continue;
        }
        if !event.content.is_empty() && event.kind != AgentEventKind::System {
            output.content = event.content;
        }
        output.metadata.extend(event.metadata);
    }
    Ok(output)
}
