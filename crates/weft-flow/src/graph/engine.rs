use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weft_core::config::{EngineConfig, WeftConfig};
use weft_core::error::{Result, WeftError};
use weft_core::event::{EventBus, WorkflowEvent, WorkflowEventKind};
use weft_core::traits::{AgentFactory, SessionStore};
use weft_core::types::{new_id, RunStatus, WorkflowRun};

use super::compiled::{CompiledGraph, Traversal};
use super::definition::{Backoff, NodeDef, NodeKind, RetryDef, WorkflowDefinition};
use super::execution::{ExecutionSummary, NodeResult, WorkflowError, WorkflowExecution, WorkflowResult};
use super::nodes::{execute_node, NodeContext};
use crate::coordinator::{Coordinator, InlineDispatcher, NodeDispatcher};
use crate::session::InMemorySessionStore;

/// Which executions [`Engine::list_executions`] returns.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub workflow_id: Option<String>,
    pub status: Option<RunStatus>,
}

impl ExecutionFilter {
    pub fn workflow(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: Some(workflow_id.into()),
            status: None,
        }
    }

    pub fn status(status: RunStatus) -> Self {
        Self {
            workflow_id: None,
            status: Some(status),
        }
    }

    fn matches(&self, summary: &ExecutionSummary) -> bool {
        self.workflow_id
            .as_deref()
            .map_or(true, |id| summary.workflow_id == id)
            && self.status.map_or(true, |s| summary.status == s)
    }
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    running: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
    finished_duration_ms: AtomicU64,
}

impl Counters {
    fn finished(&self, status: RunStatus, duration_ms: u64) {
        let counter = match status {
            RunStatus::Completed => &self.completed,
            RunStatus::Cancelled => &self.cancelled,
            RunStatus::Timeout => &self.timed_out,
            _ => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.finished_duration_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
    }
}

/// Snapshot of engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EngineMetrics {
    pub total: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub average_duration_ms: f64,
}

/// Graph workflow engine.
///
/// Holds registered definitions and live executions. Each execution runs on
/// its own task and walks the graph frontier by frontier; agent work goes
/// through the configured [`NodeDispatcher`].
pub struct Engine {
    runner: Runner,
    coordinator: Option<Arc<Coordinator>>,
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    executions: RwLock<HashMap<String, Arc<WorkflowExecution>>>,
    slots: Arc<Semaphore>,
}

impl Engine {
    /// Build an engine with an in-memory session store. Agent calls go
    /// through a supervised [`Coordinator`] when `engine.use_coordinator`
    /// is set, inline otherwise.
    pub fn new(agents: Arc<dyn AgentFactory>, config: &WeftConfig) -> Self {
        let coordinator = config
            .engine
            .use_coordinator
            .then(|| Arc::new(Coordinator::new(config.coordinator.clone(), agents.clone())));
        let dispatcher: Arc<dyn NodeDispatcher> = match &coordinator {
            Some(coordinator) => coordinator.clone(),
            None => Arc::new(InlineDispatcher::new(agents)),
        };
        let sessions: Arc<dyn SessionStore> =
            Arc::new(InMemorySessionStore::new(config.session.history_limit));

        Self {
            runner: Runner {
                config: config.engine.clone(),
                dispatcher,
                sessions,
                events: Arc::new(EventBus::new(config.events.capacity)),
                counters: Arc::new(Counters::default()),
            },
            coordinator,
            definitions: RwLock::new(HashMap::new()),
            executions: RwLock::new(HashMap::new()),
            slots: Arc::new(Semaphore::new(config.engine.max_concurrent_workflows.max(1))),
        }
    }

    pub fn with_session_store(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.runner.sessions = sessions;
        self
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.runner.events = events;
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.runner.events
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.runner.sessions
    }

    pub fn coordinator(&self) -> Option<&Arc<Coordinator>> {
        self.coordinator.as_ref()
    }

    /// Validate and store a definition under its id, replacing any previous one.
    pub fn register(&self, definition: WorkflowDefinition) -> Result<()> {
        definition.validate()?;
        info!(workflow_id = %definition.id, nodes = definition.nodes.len(), "Workflow registered");
        self.definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(definition.id.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn definition(&self, workflow_id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(workflow_id)
            .cloned()
    }

    /// Start a registered workflow. Returns the execution id immediately.
    pub fn start(&self, workflow_id: &str, inputs: HashMap<String, Value>) -> Result<String> {
        let definition = self
            .definition(workflow_id)
            .ok_or_else(|| WeftError::WorkflowNotFound(workflow_id.to_string()))?;
        self.launch(definition, inputs)
    }

    /// Start an unregistered definition. It is validated first.
    pub fn start_definition(
        &self,
        definition: WorkflowDefinition,
        inputs: HashMap<String, Value>,
    ) -> Result<String> {
        definition.validate()?;
        self.launch(Arc::new(definition), inputs)
    }

    fn launch(&self, definition: Arc<WorkflowDefinition>, inputs: HashMap<String, Value>) -> Result<String> {
        let variables = definition.resolve_inputs(inputs)?;
        let permit = self.slots.clone().try_acquire_owned().map_err(|_| {
            WeftError::Capacity(format!(
                "{} workflows already running",
                self.runner.config.max_concurrent_workflows
            ))
        })?;

        let id = new_id();
        let execution = Arc::new(WorkflowExecution::new(
            id.clone(),
            definition,
            variables,
            CancellationToken::new(),
        ));
        self.executions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), execution.clone());
        self.runner.counters.total.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(self.runner.clone().run(execution, permit));
        Ok(id)
    }

    /// Run a registered workflow to completion.
    pub async fn execute(
        &self,
        workflow_id: &str,
        inputs: HashMap<String, Value>,
    ) -> Result<WorkflowResult> {
        let id = self.start(workflow_id, inputs)?;
        self.wait(&id).await
    }

    /// Run an unregistered definition to completion.
    pub async fn execute_definition(
        &self,
        definition: WorkflowDefinition,
        inputs: HashMap<String, Value>,
    ) -> Result<WorkflowResult> {
        let id = self.start_definition(definition, inputs)?;
        self.wait(&id).await
    }

    /// Wait for an execution to reach a terminal status.
    pub async fn wait(&self, execution_id: &str) -> Result<WorkflowResult> {
        let execution = self.lookup(execution_id)?;
        Ok(execution.wait_terminal().await)
    }

    pub fn execution(&self, execution_id: &str) -> Option<Arc<WorkflowExecution>> {
        self.executions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(execution_id)
            .cloned()
    }

    fn lookup(&self, execution_id: &str) -> Result<Arc<WorkflowExecution>> {
        self.execution(execution_id)
            .ok_or_else(|| WeftError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Forget a finished execution and return its result. Live executions
    /// are refused; cancel them first.
    pub fn remove(&self, execution_id: &str) -> Result<WorkflowResult> {
        let mut executions = self.executions.write().unwrap_or_else(PoisonError::into_inner);
        let execution = executions
            .get(execution_id)
            .ok_or_else(|| WeftError::ExecutionNotFound(execution_id.to_string()))?;
        let status = execution.status();
        if !status.is_terminal() {
            return Err(WeftError::InvalidState(format!(
                "execution {} is still {}",
                execution_id, status
            )));
        }
        let result = execution.result();
        executions.remove(execution_id);
        debug!(execution_id, "Execution removed");
        Ok(result)
    }

    /// Drop every finished execution that ended before `cutoff`. Returns how
    /// many were removed.
    pub fn prune_finished(&self, cutoff: DateTime<Utc>) -> usize {
        let mut executions = self.executions.write().unwrap_or_else(PoisonError::into_inner);
        let before = executions.len();
        executions.retain(|_, e| {
            let summary = e.summary();
            !(summary.status.is_terminal() && summary.ended_at.map_or(false, |t| t < cutoff))
        });
        before - executions.len()
    }

    pub fn status(&self, execution_id: &str) -> Result<RunStatus> {
        Ok(self.lookup(execution_id)?.status())
    }

    pub fn list_executions(&self, filter: &ExecutionFilter) -> Vec<ExecutionSummary> {
        let mut list: Vec<ExecutionSummary> = self
            .executions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|e| e.summary())
            .filter(|s| filter.matches(s))
            .collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        list
    }

    /// Freeze the frontier. The node in flight finishes; the next one waits.
    pub fn pause(&self, execution_id: &str) -> Result<()> {
        let execution = self.lookup(execution_id)?;
        execution.pause()?;
        info!(execution_id, "Workflow paused");
        self.runner
            .publish(&execution, WorkflowEventKind::WorkflowPaused, None, Value::Null);
        Ok(())
    }

    pub fn resume(&self, execution_id: &str) -> Result<()> {
        let execution = self.lookup(execution_id)?;
        execution.resume()?;
        info!(execution_id, "Workflow resumed");
        self.runner
            .publish(&execution, WorkflowEventKind::WorkflowResumed, None, Value::Null);
        Ok(())
    }

    /// Cancel an execution. Cancelling a finished or already cancelled
    /// execution is a no-op.
    pub fn cancel(&self, execution_id: &str) -> Result<()> {
        let execution = self.lookup(execution_id)?;
        execution.cancel_token().cancel();
        if execution.finish(RunStatus::Cancelled) {
            info!(execution_id, "Workflow cancelled");
            execution.record_error(WorkflowError::for_execution(&WeftError::Cancelled));
            self.runner
                .publish(&execution, WorkflowEventKind::WorkflowCancelled, None, Value::Null);
        }
        self.runner.dispatcher.release_execution(execution_id);
        Ok(())
    }

    pub fn metrics(&self) -> EngineMetrics {
        let c = &self.runner.counters;
        let completed = c.completed.load(Ordering::Relaxed);
        let failed = c.failed.load(Ordering::Relaxed);
        let cancelled = c.cancelled.load(Ordering::Relaxed);
        let timed_out = c.timed_out.load(Ordering::Relaxed);
        let finished = completed + failed + cancelled + timed_out;
        let average_duration_ms = if finished == 0 {
            0.0
        } else {
            c.finished_duration_ms.load(Ordering::Relaxed) as f64 / finished as f64
        };
        EngineMetrics {
            total: c.total.load(Ordering::Relaxed),
            running: c.running.load(Ordering::Relaxed),
            completed,
            failed,
            cancelled,
            timed_out,
            average_duration_ms,
        }
    }
}

/// The part of the engine an execution task carries with it.
#[derive(Clone)]
struct Runner {
    config: EngineConfig,
    dispatcher: Arc<dyn NodeDispatcher>,
    sessions: Arc<dyn SessionStore>,
    events: Arc<EventBus>,
    counters: Arc<Counters>,
}

impl Runner {
    fn publish(
        &self,
        execution: &WorkflowExecution,
        kind: WorkflowEventKind,
        node_id: Option<&str>,
        data: Value,
    ) {
        let mut event = WorkflowEvent::new(kind, execution.id(), execution.workflow_id()).with_data(data);
        if let Some(node_id) = node_id {
            event = event.with_node(node_id);
        }
        self.events.publish(event);
    }

    async fn run(self, execution: Arc<WorkflowExecution>, _permit: OwnedSemaphorePermit) {
        let id = execution.id().to_string();
        let inputs = execution.variables();

        match self.sessions.get_or_create_session(execution.workflow_id()).await {
            Ok(session) => execution.set_session(session.id),
            Err(e) => warn!(execution_id = %id, error = %e, "Could not open session"),
        }

        if execution.mark_running().is_ok() {
            self.counters.running.fetch_add(1, Ordering::Relaxed);
            info!(execution_id = %id, workflow_id = %execution.workflow_id(), "Workflow started");
            self.publish(&execution, WorkflowEventKind::WorkflowStarted, None, Value::Null);

            let outcome = match self.config.workflow_timeout() {
                Some(limit) => self.traverse_within(&execution, limit).await,
                None => self.traverse(&execution).await,
            };

            let status = match &outcome {
                Ok(()) => RunStatus::Completed,
                Err(e) if e.is_cancelled() => RunStatus::Cancelled,
                Err(e) if e.is_timeout() => RunStatus::Timeout,
                Err(_) => RunStatus::Failed,
            };
            if status != RunStatus::Completed {
                // Stop anything still running for this execution.
                execution.cancel_token().cancel();
            }
            if execution.finish(status) {
                let kind = match status {
                    RunStatus::Completed => WorkflowEventKind::WorkflowCompleted,
                    RunStatus::Cancelled => WorkflowEventKind::WorkflowCancelled,
                    _ => WorkflowEventKind::WorkflowFailed,
                };
                let data = match &outcome {
                    Ok(()) => json!({ "status": status }),
                    Err(e) => json!({ "status": status, "error": e.to_string() }),
                };
                self.publish(&execution, kind, None, data);
            }
            self.counters.running.fetch_sub(1, Ordering::Relaxed);
        }

        self.dispatcher.release_execution(&id);

        let result = execution.result();
        self.counters.finished(result.status, result.duration_ms);
        match result.status {
            RunStatus::Completed => {
                info!(execution_id = %id, duration_ms = result.duration_ms, "Workflow completed")
            }
            status => warn!(execution_id = %id, %status, errors = result.errors.len(), "Workflow did not complete"),
        }
        self.record_run(&result, inputs.into_inner()).await;
    }

    /// Append the finished run to its session's history.
    async fn record_run(&self, result: &WorkflowResult, inputs: HashMap<String, Value>) {
        let Some(session_id) = &result.session_id else { return };
        let mut session = match self.sessions.get_session(session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => return,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Could not load session");
                return;
            }
        };
        let now = Utc::now();
        session.record_run(WorkflowRun {
            run_id: result.execution_id.clone(),
            session_id: session_id.clone(),
            workflow_id: result.workflow_id.clone(),
            status: result.status,
            input: json!(inputs),
            output: json!(result.outputs),
            error: result.errors.first().map(|e| e.message.clone()),
            started_at: result.started_at.unwrap_or(now),
            ended_at: result.ended_at.unwrap_or(now),
            duration_ms: result.duration_ms,
        });
        if let Err(e) = self.sessions.save_session(session).await {
            warn!(session_id = %session_id, error = %e, "Could not save session");
        }
    }

    /// Traverse under a deadline. When it passes, the execution is cancelled
    /// and the traversal is still awaited so the node in flight lands in the
    /// trace as cancelled.
    async fn traverse_within(&self, execution: &Arc<WorkflowExecution>, limit: Duration) -> Result<()> {
        let traversal = self.traverse(execution);
        tokio::pin!(traversal);
        tokio::select! {
            outcome = &mut traversal => outcome,
            _ = tokio::time::sleep(limit) => {
                warn!(execution_id = %execution.id(), timeout_ms = limit.as_millis() as u64, "Workflow timed out");
                execution.cancel_token().cancel();
                if let Err(e) = traversal.await {
                    debug!(execution_id = %execution.id(), error = %e, "Traversal stopped after timeout");
                }
                let err = WeftError::Timeout {
                    target: format!("workflow {}", execution.workflow_id()),
                    timeout_ms: limit.as_millis() as u64,
                };
                execution.record_error(WorkflowError::for_execution(&err));
                Err(err)
            }
        }
    }

    /// Walk the graph frontier by frontier until nothing is ready.
    async fn traverse(&self, execution: &Arc<WorkflowExecution>) -> Result<()> {
        let graph = CompiledGraph::new(execution.definition().clone());
        let mut walk = Traversal::new(&graph);
        let mut frontier = walk.initial_frontier(&graph);

        while !frontier.is_empty() {
            execution.set_current(frontier.iter().map(|&i| graph.node(i).id.clone()).collect());
            let mut next = Vec::new();
            for idx in frontier {
                execution.wait_if_paused().await?;
                self.run_node(execution, graph.node(idx)).await?;
                let vars = execution.variables();
                next.extend(walk.complete(&graph, idx, &vars));
            }
            next.sort_unstable();
            next.dedup();
            frontier = next;
        }

        let stranded = walk.stranded(&graph);
        if !stranded.is_empty() {
            warn!(execution_id = %execution.id(), nodes = ?stranded, "Nodes never became ready");
            execution.add_warning(format!("nodes never became ready: {}", stranded.join(", ")));
        }
        Ok(())
    }

    /// Retry policy for a node: its own, the workflow default, then the
    /// engine default. Only nodes that call agents retry.
    fn retry_policy(&self, node: &NodeDef, definition: &WorkflowDefinition) -> Option<RetryDef> {
        if !matches!(
            node.kind,
            NodeKind::Task { .. } | NodeKind::Loop { .. } | NodeKind::Parallel { .. }
        ) {
            return None;
        }
        node.retry
            .clone()
            .or_else(|| definition.config.as_ref()?.default_retry.clone())
            .or_else(|| {
                let r = &self.config.retry;
                (r.max_retries > 0).then(|| RetryDef {
                    max_attempts: r.max_retries + 1,
                    delay_ms: r.initial_backoff_ms,
                    backoff: Backoff::Exponential,
                    max_delay_ms: Some(r.max_backoff_ms),
                })
            })
    }

    fn node_timeout(&self, node: &NodeDef, definition: &WorkflowDefinition) -> Duration {
        node.timeout()
            .or_else(|| {
                definition
                    .config
                    .as_ref()?
                    .default_timeout_ms
                    .map(Duration::from_millis)
            })
            .unwrap_or_else(|| self.config.node_timeout())
    }

    async fn run_node(&self, execution: &Arc<WorkflowExecution>, node: &NodeDef) -> Result<()> {
        let definition = execution.definition();
        let retry = self.retry_policy(node, definition);
        let ctx = NodeContext {
            execution,
            dispatcher: &self.dispatcher,
            timeout: self.node_timeout(node, definition),
            max_concurrency: definition.config.as_ref().and_then(|c| c.max_concurrency),
        };

        debug!(execution_id = %execution.id(), node_id = %node.id, node_type = node.kind.type_name(), "Node started");
        self.publish(execution, WorkflowEventKind::NodeStarted, Some(&node.id), Value::Null);

        let mut record = NodeResult::started(node);
        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            let err = match execute_node(&ctx, node, &mut record).await {
                Ok(()) => break Ok(()),
                Err(e) => e,
            };
            let policy = match &retry {
                Some(policy) if attempt < policy.max_attempts && err.is_retryable() => policy,
                _ => break Err(err),
            };
            let delay = policy.delay_for(attempt);
            warn!(
                node_id = %node.id,
                attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Node failed, retrying"
            );
            record.retry_count = attempt;
            tokio::select! {
                _ = execution.cancel_token().cancelled() => break Err(WeftError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        match outcome {
            Ok(()) => {
                record.finish(RunStatus::Completed);
                debug!(node_id = %node.id, duration_ms = record.duration_ms, "Node completed");
                self.publish(
                    execution,
                    WorkflowEventKind::NodeCompleted,
                    Some(&node.id),
                    json!({ "outputs": record.outputs, "duration_ms": record.duration_ms }),
                );
                execution.record_result(record);
                Ok(())
            }
            Err(e) if e.is_cancelled() => {
                record.error = Some(e.to_string());
                record.finish(RunStatus::Cancelled);
                execution.record_result(record);
                Err(e)
            }
            Err(e) if node.skip_on_error => {
                warn!(node_id = %node.id, error = %e, "Node failed, skipping");
                record.error = Some(e.to_string());
                record.finish(RunStatus::Skipped);
                execution.add_warning(format!("node {} skipped after error: {}", node.id, e));
                self.publish(
                    execution,
                    WorkflowEventKind::NodeSkipped,
                    Some(&node.id),
                    json!({ "error": e.to_string() }),
                );
                execution.record_result(record);
                Ok(())
            }
            Err(e) => {
                error!(execution_id = %execution.id(), node_id = %node.id, error = %e, "Node failed");
                record.error = Some(e.to_string());
                record.finish(if e.is_timeout() {
                    RunStatus::Timeout
                } else {
                    RunStatus::Failed
                });
                execution.record_error(WorkflowError::for_node(node, &e));
                self.publish(
                    execution,
                    WorkflowEventKind::NodeFailed,
                    Some(&node.id),
                    json!({ "error": e.to_string(), "retryable": e.is_retryable() }),
                );
                execution.record_result(record);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::builder::WorkflowBuilder;
    use weft_core::error::ErrorKind;
    use crate::graph::definition::AgentRef;
    use weft_test_utils::{EchoAgent, FlakyAgent, MockAgentFactory, SlowAgent};

    fn engine(config: WeftConfig) -> Engine {
        let factory = MockAgentFactory::new()
            .with_agent("echo", Arc::new(EchoAgent::new()))
            .with_agent("slow", Arc::new(SlowAgent::new(Duration::from_millis(300))))
            .with_agent("flaky", Arc::new(FlakyAgent::new(2)));
        Engine::new(Arc::new(factory), &config)
    }

    fn linear(id: &str, template: &str) -> WorkflowDefinition {
        WorkflowBuilder::new(id, id)
            .add_start_node("start")
            .add_task_node("work", "Work", AgentRef::new(template))
            .add_end_node("end")
            .chain(&["start", "work", "end"])
            .build()
    }

    fn inputs(message: &str) -> HashMap<String, Value> {
        HashMap::from([("message".to_string(), json!(message))])
    }

    #[tokio::test]
    async fn test_unknown_workflow_and_execution() {
        let engine = engine(WeftConfig::default());
        assert!(matches!(
            engine.start("ghost", HashMap::new()),
            Err(WeftError::WorkflowNotFound(_))
        ));
        assert!(matches!(engine.status("nope"), Err(WeftError::ExecutionNotFound(_))));
        assert!(engine.cancel("nope").is_err());
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let mut config = WeftConfig::default();
        config.engine.max_concurrent_workflows = 1;
        let engine = engine(config);
        engine.register(linear("slow", "slow")).unwrap();

        let first = engine.start("slow", inputs("a")).unwrap();
        assert!(matches!(
            engine.start("slow", inputs("b")),
            Err(WeftError::Capacity(_))
        ));
        engine.wait(&first).await.unwrap();
        // The slot is released once the run ends.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = engine.start("slow", inputs("c")).unwrap();
        assert!(engine.wait(&second).await.unwrap().succeeded());
    }

    #[tokio::test]
    async fn test_retry_recovers_flaky_node() {
        let engine = engine(WeftConfig::default());
        let def = WorkflowBuilder::new("retry", "Retry")
            .add_start_node("start")
            .add_task_node("work", "Work", AgentRef::new("flaky"))
            .retry(RetryDef::new(3, 10, Backoff::Fixed))
            .add_end_node("end")
            .chain(&["start", "work", "end"])
            .build();
        let result = engine.execute_definition(def, inputs("x")).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.node("work").unwrap().retry_count, 2);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let engine = engine(WeftConfig::default());
        engine.register(linear("slow", "slow")).unwrap();
        let id = engine.start("slow", inputs("a")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        engine.cancel(&id).unwrap();
        engine.cancel(&id).unwrap();
        let result = engine.wait(&id).await.unwrap();
        assert_eq!(result.status, RunStatus::Cancelled);
        assert!(result.ended_at.is_some());
        assert_eq!(result.errors.len(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let m = engine.metrics();
        assert_eq!(m.cancelled, 1);
        assert_eq!(m.running, 0);
    }

    #[tokio::test]
    async fn test_workflow_timeout() {
        let mut config = WeftConfig::default();
        config.engine.workflow_timeout_ms = 50;
        let engine = engine(config);
        let result = engine
            .execute_definition(linear("slow", "slow"), inputs("a"))
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Timeout);

        // The node that was running when the deadline passed is still traced.
        let work = result.node("work").unwrap();
        assert_eq!(work.status, RunStatus::Cancelled);
        assert!(work.ended_at.is_some());
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].kind, ErrorKind::Timeout);
        assert!(result.node("end").is_none());
    }

    #[tokio::test]
    async fn test_remove_only_finished_executions() {
        let engine = engine(WeftConfig::default());
        engine.register(linear("slow", "slow")).unwrap();
        engine.register(linear("fast", "echo")).unwrap();

        let running = engine.start("slow", inputs("a")).unwrap();
        assert!(matches!(engine.remove(&running), Err(WeftError::InvalidState(_))));

        let done = engine.start("fast", inputs("b")).unwrap();
        engine.wait(&done).await.unwrap();
        let removed = engine.remove(&done).unwrap();
        assert_eq!(removed.status, RunStatus::Completed);
        assert!(engine.execution(&done).is_none());
        assert!(matches!(engine.remove(&done), Err(WeftError::ExecutionNotFound(_))));

        engine.wait(&running).await.unwrap();
        assert_eq!(engine.prune_finished(Utc::now() + chrono::Duration::seconds(1)), 1);
        assert!(engine.list_executions(&ExecutionFilter::default()).is_empty());
    }

    #[tokio::test]
    async fn test_list_and_metrics() {
        let engine = engine(WeftConfig::default());
        engine.register(linear("a", "echo")).unwrap();
        engine.register(linear("b", "echo")).unwrap();
        engine.execute("a", inputs("1")).await.unwrap();
        engine.execute("a", inputs("2")).await.unwrap();
        engine.execute("b", inputs("3")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(engine.list_executions(&ExecutionFilter::workflow("a")).len(), 2);
        assert_eq!(
            engine
                .list_executions(&ExecutionFilter::status(RunStatus::Completed))
                .len(),
            3
        );
        let m = engine.metrics();
        assert_eq!(m.total, 3);
        assert_eq!(m.completed, 3);
    }
}
