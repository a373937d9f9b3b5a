//! Node dispatch: where task, loop and parallel-branch work actually runs.
//!
//! The engine hands every agent call to a [`NodeDispatcher`]. The
//! [`InlineDispatcher`] runs it on the engine's own task; the actor-backed
//! [`Coordinator`] routes it to a persistent, supervised worker per
//! (execution, node) pair and waits for the reply with a bounded timeout.

mod worker;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use weft_core::config::CoordinatorConfig;
use weft_core::error::{Result, WeftError};
use weft_core::traits::{collect_content, AgentExecutor, AgentFactory};
use weft_core::types::{AgentOutput, AgentRef};

use worker::{WorkItem, WorkerContext, WorkerCounters, WorkerHandle};

/// One agent invocation on behalf of a node.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub execution_id: String,
    /// Node id, or `<node>-<branch>` for a parallel branch.
    pub worker_key: String,
    pub node_id: String,
    pub node_name: String,
    pub agent: AgentRef,
    pub input: String,
    pub timeout: Duration,
    /// Scope the call runs under; cancelling it abandons the call.
    pub cancel: CancellationToken,
}

/// Executes agent calls for the engine.
pub trait NodeDispatcher: Send + Sync + 'static {
    /// Run one request, honouring its timeout and cancellation scope.
    fn dispatch(&self, request: TaskRequest) -> BoxFuture<'_, Result<AgentOutput>>;

    /// Tear down anything held for an execution. Safe to call repeatedly.
    fn release_execution(&self, execution_id: &str) {
        let _ = execution_id;
    }
}

/// Drive an agent to its final content under a cancellation scope.
pub(crate) async fn invoke(
    agent: &Arc<dyn AgentExecutor>,
    input: String,
    cancel: &CancellationToken,
) -> Result<AgentOutput> {
    let stream = agent.execute(cancel.clone(), input);
    collect_content(stream, cancel).await
}

/// Map an agent-side failure onto the node that requested it.
fn attribute(request: &TaskRequest, err: WeftError) -> WeftError {
    match err {
        WeftError::Cancelled | WeftError::Timeout { .. } | WeftError::NodeExecution { .. } => err,
        WeftError::AgentNotFound(_) | WeftError::Validation(_) | WeftError::Config(_) => {
            WeftError::node(&request.node_id, &request.node_name, err.to_string(), false)
        }
        other => WeftError::node(&request.node_id, &request.node_name, other.to_string(), true),
    }
}

fn timeout_error(request: &TaskRequest) -> WeftError {
    WeftError::Timeout {
        target: format!("node {}", request.worker_key),
        timeout_ms: request.timeout.as_millis() as u64,
    }
}

/// Runs each call directly on the caller's task.
pub struct InlineDispatcher {
    agents: Arc<dyn AgentFactory>,
}

impl InlineDispatcher {
    pub fn new(agents: Arc<dyn AgentFactory>) -> Self {
        Self { agents }
    }
}

impl NodeDispatcher for InlineDispatcher {
    fn dispatch(&self, request: TaskRequest) -> BoxFuture<'_, Result<AgentOutput>> {
        Box::pin(async move {
            let call = request.cancel.child_token();
            let work = async {
                let agent = self
                    .agents
                    .create_agent(&request.agent, &request.agent.config)
                    .await?;
                invoke(&agent, request.input.clone(), &call).await
            };

            let result = tokio::select! {
                _ = request.cancel.cancelled() => Err(WeftError::Cancelled),
                r = tokio::time::timeout(request.timeout, work) => match r {
                    Ok(r) => r,
                    Err(_) => {
                        call.cancel();
                        Err(timeout_error(&request))
                    }
                },
            };
            result.map_err(|e| attribute(&request, e))
        })
    }
}

/// Snapshot of coordinator activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct CoordinatorStats {
    pub live_workers: usize,
    pub workers_spawned: u64,
    pub restarts: u64,
    pub requests_handled: u64,
}

/// Actor-backed dispatcher with one supervised worker per (execution, key).
pub struct Coordinator {
    config: CoordinatorConfig,
    agents: Arc<dyn AgentFactory>,
    limiter: Arc<Semaphore>,
    counters: Arc<WorkerCounters>,
    shutdown: CancellationToken,
    workers: Mutex<HashMap<String, HashMap<String, WorkerHandle>>>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, agents: Arc<dyn AgentFactory>) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_concurrent_agents.max(1)));
        Self {
            config,
            agents,
            limiter,
            counters: Arc::new(WorkerCounters::default()),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Look up the worker for a request, spawning one if needed.
    fn worker_for(&self, request: &TaskRequest) -> Result<tokio::sync::mpsc::Sender<WorkItem>> {
        if self.shutdown.is_cancelled() {
            return Err(WeftError::InvalidState("coordinator is shut down".into()));
        }
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        let per_exec = workers.entry(request.execution_id.clone()).or_default();

        if let Some(handle) = per_exec.get(&request.worker_key) {
            if handle.is_alive() {
                return Ok(handle.tx.clone());
            }
            // A worker that exhausted its restart budget stays down.
            return Err(WeftError::node(
                &request.node_id,
                &request.node_name,
                format!("worker {} is unavailable", request.worker_key),
                false,
            ));
        }

        let ctx = WorkerContext {
            key: format!("{}/{}", request.execution_id, request.worker_key),
            agents: self.agents.clone(),
            limiter: self.limiter.clone(),
            counters: self.counters.clone(),
            max_restarts: self.config.supervision.max_restarts,
            restart_window: self.config.supervision.window(),
            stop: self.shutdown.child_token(),
        };
        debug!(worker = %ctx.key, "Spawning worker");
        let handle = worker::spawn(ctx, self.config.mailbox_size);
        let tx = handle.tx.clone();
        per_exec.insert(request.worker_key.clone(), handle);
        Ok(tx)
    }

    /// Number of live workers across all executions.
    pub fn worker_count(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|m| m.values().filter(|h| h.is_alive()).count())
            .sum()
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            live_workers: self.worker_count(),
            workers_spawned: self.counters.spawned.load(Ordering::Relaxed),
            restarts: self.counters.restarts.load(Ordering::Relaxed),
            requests_handled: self.counters.handled.load(Ordering::Relaxed),
        }
    }

    /// Stop every worker of every execution.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!("Coordinator shut down");
    }
}

impl NodeDispatcher for Coordinator {
    fn dispatch(&self, request: TaskRequest) -> BoxFuture<'_, Result<AgentOutput>> {
        Box::pin(async move {
            let tx = self.worker_for(&request)?;
            let call = request.cancel.child_token();
            let (respond, reply) = oneshot::channel();
            let item = WorkItem {
                agent: request.agent.clone(),
                input: request.input.clone(),
                cancel: call.clone(),
                respond,
            };

            let deadline = tokio::time::sleep(request.timeout);
            tokio::pin!(deadline);

            // Enqueue; a full mailbox applies backpressure.
            tokio::select! {
                _ = request.cancel.cancelled() => return Err(WeftError::Cancelled),
                _ = &mut deadline => return Err(timeout_error(&request)),
                sent = tx.send(item) => {
                    if sent.is_err() {
                        return Err(WeftError::node(
                            &request.node_id,
                            &request.node_name,
                            format!("worker {} stopped", request.worker_key),
                            true,
                        ));
                    }
                }
            }

            let result = tokio::select! {
                _ = request.cancel.cancelled() => Err(WeftError::Cancelled),
                _ = &mut deadline => {
                    call.cancel();
                    warn!(
                        execution_id = %request.execution_id,
                        worker = %request.worker_key,
                        timeout_ms = request.timeout.as_millis() as u64,
                        "Worker reply timed out"
                    );
                    Err(timeout_error(&request))
                }
                reply = reply => match reply {
                    Ok(r) => r,
                    // Sender dropped without a reply: the worker crashed mid-call.
                    Err(_) => Err(WeftError::node(
                        &request.node_id,
                        &request.node_name,
                        format!("worker {} crashed while handling the request", request.worker_key),
                        true,
                    )),
                },
            };
            result.map_err(|e| attribute(&request, e))
        })
    }

    fn release_execution(&self, execution_id: &str) {
        let removed = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(execution_id);
        if let Some(workers) = removed {
            debug!(execution_id, count = workers.len(), "Releasing workers");
            for handle in workers.values() {
                handle.stop.cancel();
            }
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
