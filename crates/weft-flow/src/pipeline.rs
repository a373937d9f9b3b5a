//! Linear pipelines: an ordered list of steps run under a session.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use weft_core::error::{Result, WeftError};
use weft_core::traits::SessionStore;
use weft_core::types::{new_id, RunStatus, SessionId, WorkflowRun, WorkflowSession};

use crate::step::{run_step, Step, StepInput, StepOutput};

/// Lifecycle event of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    WorkflowStarted,
    StepStarted,
    StepCompleted,
    StepSkipped,
    StepFailed,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
}

impl RunEventKind {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted | Self::WorkflowFailed | Self::WorkflowCancelled
        )
    }
}

/// Step counts and timing for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub total_steps: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub kind: RunEventKind,
    pub run_id: String,
    pub pipeline_id: String,
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<StepOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<RunMetrics>,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of [`Pipeline::execute`].
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub session_id: SessionId,
    pub status: RunStatus,
    /// Content of the last step that was not skipped.
    pub content: Value,
    pub outputs: Vec<StepOutput>,
    pub error: Option<String>,
    pub metrics: RunMetrics,
}

/// Sends run events when someone is listening.
struct Emitter {
    tx: Option<mpsc::Sender<Result<RunEvent>>>,
    run_id: String,
    pipeline_id: String,
    session_id: SessionId,
}

impl Emitter {
    fn event(&self, kind: RunEventKind) -> RunEvent {
        RunEvent {
            kind,
            run_id: self.run_id.clone(),
            pipeline_id: self.pipeline_id.clone(),
            session_id: self.session_id.clone(),
            step_name: None,
            step_index: None,
            output: None,
            error: None,
            metrics: None,
            timestamp: Utc::now(),
        }
    }

    fn step(&self, kind: RunEventKind, index: usize, name: &str) -> RunEvent {
        RunEvent {
            step_name: Some(name.to_string()),
            step_index: Some(index),
            ..self.event(kind)
        }
    }

    async fn send(&self, event: RunEvent) {
        if let Some(tx) = &self.tx {
            // The receiver may have gone away; the run still finishes.
            let _ = tx.send(Ok(event)).await;
        }
    }
}

/// An ordered list of steps sharing a session.
#[derive(Clone)]
pub struct Pipeline {
    id: String,
    name: String,
    steps: Vec<Arc<dyn Step>>,
    sessions: Arc<dyn SessionStore>,
    num_history_runs: usize,
}

impl Pipeline {
    /// The pipeline's id defaults to its name; sessions are keyed by id.
    pub fn new(name: impl Into<String>, sessions: Arc<dyn SessionStore>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            steps: Vec::new(),
            sessions,
            num_history_runs: 0,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn add_step(mut self, step: impl Step) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn add_shared_step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    /// Expose the outputs of the last `n` runs as `session_state.history`.
    pub fn with_history_runs(mut self, n: usize) -> Self {
        self.num_history_runs = n;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Arc<dyn Step>] {
        &self.steps
    }

    /// Run in a background task, streaming events as they happen.
    ///
    /// The stream ends after the terminal workflow event. An `Err` item means
    /// the run could not start (no steps, session store failure).
    pub fn run(&self, cancel: CancellationToken, input: StepInput) -> BoxStream<'static, Result<RunEvent>> {
        let (tx, rx) = mpsc::channel(64);
        let pipeline = self.clone();
        tokio::spawn(async move {
            if let Err(e) = pipeline.drive(cancel, input, Some(tx.clone())).await {
                let _ = tx.send(Err(e)).await;
            }
        });
        Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }))
    }

    /// Run to completion and return the outcome.
    pub async fn execute(&self, cancel: CancellationToken, input: StepInput) -> Result<PipelineRun> {
        self.drive(cancel, input, None).await
    }

    async fn drive(
        &self,
        cancel: CancellationToken,
        mut input: StepInput,
        tx: Option<mpsc::Sender<Result<RunEvent>>>,
    ) -> Result<PipelineRun> {
        if self.steps.is_empty() {
            return Err(WeftError::Validation(format!("pipeline {} has no steps", self.name)));
        }
        let session = self.sessions.get_or_create_session(&self.id).await?;
        let emit = Emitter {
            tx,
            run_id: new_id(),
            pipeline_id: self.id.clone(),
            session_id: session.id.clone(),
        };
        let started_at = Utc::now();
        let raw_input = input.input.clone();

        let mut state = session.state.clone();
        state.extend(std::mem::take(&mut input.session_state));
        if self.num_history_runs > 0 {
            let history: Vec<Value> = session
                .recent_runs(self.num_history_runs)
                .into_iter()
                .map(|r| r.output.clone())
                .collect();
            state.insert("history".into(), Value::Array(history));
        }
        input.session_state = state;

        info!(pipeline = %self.name, run_id = %emit.run_id, session_id = %session.id, steps = self.steps.len(), "Pipeline started");
        emit.send(emit.event(RunEventKind::WorkflowStarted)).await;

        let mut metrics = RunMetrics {
            total_steps: self.steps.len(),
            ..Default::default()
        };
        let mut outputs = Vec::with_capacity(self.steps.len());
        let mut content = Value::Null;
        let mut status = RunStatus::Completed;
        let mut error = None;
        let mut current = input;

        for (index, step) in self.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                status = RunStatus::Cancelled;
                break;
            }
            emit.send(emit.step(RunEventKind::StepStarted, index, step.name())).await;

            match run_step(step.as_ref(), &cancel, current.clone()).await {
                Ok(out) if out.skipped => {
                    metrics.skipped += 1;
                    let mut event = emit.step(RunEventKind::StepSkipped, index, step.name());
                    event.error = out.error.clone();
                    event.output = Some(out.clone());
                    emit.send(event).await;
                    outputs.push(out);
                }
                Ok(out) => {
                    metrics.succeeded += 1;
                    content = out.content.clone();
                    current = current.chained(&out);
                    let mut event = emit.step(RunEventKind::StepCompleted, index, step.name());
                    event.output = Some(out.clone());
                    emit.send(event).await;
                    outputs.push(out);
                }
                Err(e) if e.is_cancelled() => {
                    status = RunStatus::Cancelled;
                    break;
                }
                Err(e) => {
                    warn!(pipeline = %self.name, step = %step.name(), error = %e, "Pipeline step failed");
                    metrics.failed += 1;
                    let mut event = emit.step(RunEventKind::StepFailed, index, step.name());
                    event.error = Some(e.to_string());
                    emit.send(event).await;
                    status = if e.is_timeout() { RunStatus::Timeout } else { RunStatus::Failed };
                    error = Some(e.to_string());
                    break;
                }
            }
        }

        let ended_at = Utc::now();
        metrics.duration_ms = (ended_at - started_at).num_milliseconds().max(0) as u64;
        if status == RunStatus::Cancelled {
            error = Some(WeftError::Cancelled.to_string());
        }

        self.record_run(
            session,
            WorkflowRun {
                run_id: emit.run_id.clone(),
                session_id: emit.session_id.clone(),
                workflow_id: self.id.clone(),
                status,
                input: raw_input,
                output: content.clone(),
                error: error.clone(),
                started_at,
                ended_at,
                duration_ms: metrics.duration_ms,
            },
        )
        .await;

        let kind = match status {
            RunStatus::Completed => RunEventKind::WorkflowCompleted,
            RunStatus::Cancelled => RunEventKind::WorkflowCancelled,
            _ => RunEventKind::WorkflowFailed,
        };
        info!(pipeline = %self.name, run_id = %emit.run_id, %status, succeeded = metrics.succeeded, skipped = metrics.skipped, duration_ms = metrics.duration_ms, "Pipeline finished");
        let mut event = emit.event(kind);
        event.error = error.clone();
        event.metrics = Some(metrics.clone());
        emit.send(event).await;

        Ok(PipelineRun {
            run_id: emit.run_id,
            session_id: emit.session_id,
            status,
            content,
            outputs,
            error,
            metrics,
        })
    }

    /// Re-read the session so concurrent runs don't overwrite each other's
    /// history, then append this run.
    async fn record_run(&self, fallback: WorkflowSession, run: WorkflowRun) {
        let mut session = match self.sessions.get_session(&fallback.id).await {
            Ok(Some(session)) => session,
            Ok(None) => fallback,
            Err(e) => {
                warn!(session_id = %fallback.id, error = %e, "Could not reload session");
                fallback
            }
        };
        session.record_run(run);
        if let Err(e) = self.sessions.save_session(session).await {
            warn!(pipeline = %self.name, error = %e, "Could not save session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InMemorySessionStore;
    use crate::step::{AgentStep, FunctionStep, StepConfig};
    use futures::TryStreamExt;
    use serde_json::json;
    use std::time::Duration;
    use weft_test_utils::SlowAgent;

    fn store() -> Arc<InMemorySessionStore> {
        Arc::new(InMemorySessionStore::new(10))
    }

    fn shout() -> FunctionStep {
        FunctionStep::transform("shout", |v| json!(v.as_str().unwrap_or_default().to_uppercase()))
    }

    fn exclaim() -> FunctionStep {
        FunctionStep::transform("exclaim", |v| json!(format!("{}!", v.as_str().unwrap_or_default())))
    }

    #[tokio::test]
    async fn test_streamed_events_in_order() {
        let pipeline = Pipeline::new("greet", store()).add_step(shout()).add_step(exclaim());
        let events: Vec<RunEvent> = pipeline
            .run(CancellationToken::new(), StepInput::new("hi"))
            .try_collect()
            .await
            .unwrap();

        let kinds: Vec<RunEventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                RunEventKind::WorkflowStarted,
                RunEventKind::StepStarted,
                RunEventKind::StepCompleted,
                RunEventKind::StepStarted,
                RunEventKind::StepCompleted,
                RunEventKind::WorkflowCompleted,
            ]
        );
        assert_eq!(events[4].output.as_ref().unwrap().content, json!("HI!"));
        assert_eq!(events[5].metrics.as_ref().unwrap().succeeded, 2);
    }

    #[tokio::test]
    async fn test_skipped_step_keeps_previous_content() {
        let broken = FunctionStep::new("broken", |_| Err(WeftError::Agent("down".into())))
            .with_config(StepConfig::default().skip_on_error());
        let pipeline = Pipeline::new("p", store()).add_step(shout()).add_step(broken).add_step(exclaim());
        let run = pipeline
            .execute(CancellationToken::new(), StepInput::new("hey"))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.content, json!("HEY!"));
        assert_eq!(run.metrics.skipped, 1);
        assert_eq!(run.outputs.len(), 3);
    }

    #[tokio::test]
    async fn test_failure_stops_the_run() {
        let broken = FunctionStep::new("broken", |_| Err(WeftError::Agent("down".into())));
        let pipeline = Pipeline::new("p", store()).add_step(broken).add_step(exclaim());
        let run = pipeline
            .execute(CancellationToken::new(), StepInput::new("x"))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.metrics.failed, 1);
        assert_eq!(run.outputs.len(), 0);
        assert!(run.error.unwrap().contains("down"));
    }

    #[tokio::test]
    async fn test_session_history_across_runs() {
        let sessions = store();
        let pipeline = Pipeline::new("p", sessions.clone())
            .add_step(FunctionStep::new("peek", |i| {
                Ok(i.session_state.get("history").cloned().unwrap_or(json!([])))
            }))
            .with_history_runs(2);

        let cancel = CancellationToken::new();
        let first = pipeline.execute(cancel.clone(), StepInput::new("a")).await.unwrap();
        assert_eq!(first.content, json!([]));
        pipeline.execute(cancel.clone(), StepInput::new("b")).await.unwrap();
        let third = pipeline.execute(cancel.clone(), StepInput::new("c")).await.unwrap();
        assert_eq!(third.content, json!([[], [[]]]));
        assert_eq!(third.session_id, first.session_id);

        let session = sessions.get_session(&first.session_id).await.unwrap().unwrap();
        assert_eq!(session.history.len(), 3);
    }

    #[tokio::test]
    async fn test_cancel_mid_step() {
        let pipeline = Pipeline::new("p", store())
            .add_step(AgentStep::new("slow", Arc::new(SlowAgent::new(Duration::from_secs(10)))))
            .add_step(exclaim());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });
        let run = tokio::time::timeout(
            Duration::from_secs(2),
            pipeline.execute(cancel, StepInput::new("x")),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_empty_pipeline_is_rejected() {
        let pipeline = Pipeline::new("empty", store());
        let items: Vec<Result<RunEvent>> = futures::StreamExt::collect(
            pipeline.run(CancellationToken::new(), StepInput::new("x")),
        )
        .await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(WeftError::Validation(_))));
    }
}
