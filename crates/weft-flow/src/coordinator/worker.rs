use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use weft_core::error::{Result, WeftError};
use weft_core::traits::{AgentExecutor, AgentFactory};
use weft_core::types::{AgentOutput, AgentRef};

use super::invoke;

/// A unit of work queued in a worker's mailbox.
pub(crate) struct WorkItem {
    pub agent: AgentRef,
    pub input: String,
    /// Scope of this call only; cancelled on timeout or execution cancel.
    pub cancel: CancellationToken,
    pub respond: oneshot::Sender<Result<AgentOutput>>,
}

/// Counters shared by every worker of a coordinator.
#[derive(Debug, Default)]
pub(crate) struct WorkerCounters {
    pub spawned: AtomicU64,
    pub restarts: AtomicU64,
    pub handled: AtomicU64,
}

/// Settings a worker needs, cloned per spawn.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub key: String,
    pub agents: Arc<dyn AgentFactory>,
    pub limiter: Arc<Semaphore>,
    pub counters: Arc<WorkerCounters>,
    pub max_restarts: u32,
    pub restart_window: Duration,
    pub stop: CancellationToken,
}

/// Handle to a running, supervised worker.
pub(crate) struct WorkerHandle {
    pub tx: mpsc::Sender<WorkItem>,
    pub stop: CancellationToken,
    pub task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed() && !self.task.is_finished()
    }
}

/// Spawn a worker with a bounded mailbox under a restart supervisor.
pub(crate) fn spawn(ctx: WorkerContext, mailbox_size: usize) -> WorkerHandle {
    let (tx, rx) = mpsc::channel(mailbox_size.max(1));
    let stop = ctx.stop.clone();
    ctx.counters.spawned.fetch_add(1, Ordering::Relaxed);
    let task = tokio::spawn(supervise(ctx, rx));
    WorkerHandle { tx, stop, task }
}

/// Restart the worker body after a panic, at most `max_restarts` times within
/// `restart_window`. The mailbox survives restarts.
async fn supervise(ctx: WorkerContext, rx: mpsc::Receiver<WorkItem>) {
    let rx = Arc::new(Mutex::new(rx));
    let mut restarts: VecDeque<Instant> = VecDeque::new();

    loop {
        let body = tokio::spawn(run(ctx.clone(), rx.clone()));
        match body.await {
            Ok(()) => break,
            Err(e) if e.is_panic() => {
                let now = Instant::now();
                while restarts
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > ctx.restart_window)
                {
                    restarts.pop_front();
                }
                if restarts.len() as u32 >= ctx.max_restarts {
                    error!(
                        worker = %ctx.key,
                        max_restarts = ctx.max_restarts,
                        "Worker restart budget exhausted, stopping"
                    );
                    break;
                }
                restarts.push_back(now);
                ctx.counters.restarts.fetch_add(1, Ordering::Relaxed);
                warn!(worker = %ctx.key, attempt = restarts.len(), "Worker crashed, restarting");
            }
            Err(_) => break,
        }
    }

    // Refuse anything still queued so callers are not left waiting.
    rx.lock().await.close();
    debug!(worker = %ctx.key, "Worker stopped");
}

/// Worker body: read the mailbox until stopped. The agent is created on the
/// first request and reused afterwards.
async fn run(ctx: WorkerContext, rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>) {
    let mut rx = rx.lock().await;
    let mut agent: Option<Arc<dyn AgentExecutor>> = None;

    loop {
        let item = tokio::select! {
            _ = ctx.stop.cancelled() => break,
            item = rx.recv() => item,
        };
        let Some(item) = item else { break };
        if item.respond.is_closed() {
            // Requester already gave up (timeout or cancel).
            continue;
        }

        let result = tokio::select! {
            _ = ctx.stop.cancelled() => Err(WeftError::Cancelled),
            r = handle(&ctx, &mut agent, &item) => r,
        };
        ctx.counters.handled.fetch_add(1, Ordering::Relaxed);
        let _ = item.respond.send(result);
    }
}

async fn handle(
    ctx: &WorkerContext,
    agent: &mut Option<Arc<dyn AgentExecutor>>,
    item: &WorkItem,
) -> Result<AgentOutput> {
    let _permit = tokio::select! {
        _ = item.cancel.cancelled() => return Err(WeftError::Cancelled),
        permit = ctx.limiter.acquire() => permit
            .map_err(|_| WeftError::InvalidState("coordinator is shut down".into()))?,
    };

    let executor = match agent {
        Some(a) => a.clone(),
        None => {
            let created = ctx
                .agents
                .create_agent(&item.agent, &item.agent.config)
                .await?;
            *agent = Some(created.clone());
            created
        }
    };

    invoke(&executor, item.input.clone(), &item.cancel).await
}
