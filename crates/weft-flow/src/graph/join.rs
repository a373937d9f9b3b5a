use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::types::{AgentOutput, RunStatus};

use super::definition::{JoinType, NodeDef};
use super::execution::NodeResult;
use crate::coordinator::{NodeDispatcher, TaskRequest};

/// One branch to fan out to.
pub(crate) struct Branch {
    pub id: String,
    pub name: String,
    pub request: TaskRequest,
}

/// How far a join has got after each reply.
enum Verdict {
    Pending,
    Succeeded,
    Failed(WeftError),
}

struct Tally {
    join: JoinType,
    total: usize,
    ok: usize,
    failed: usize,
    timed_out: usize,
    cancelled: usize,
    /// Longest limit among the timed-out branches.
    timeout_ms: u64,
    winner: Option<usize>,
}

impl Tally {
    fn new(join: JoinType, total: usize) -> Self {
        Self {
            join,
            total,
            ok: 0,
            failed: 0,
            timed_out: 0,
            cancelled: 0,
            timeout_ms: 0,
            winner: None,
        }
    }

    fn observe(&mut self, idx: usize, result: &Result<AgentOutput>, node: &NodeDef) -> Verdict {
        match result {
            Ok(_) => self.ok += 1,
            Err(e) => {
                self.failed += 1;
                match e {
                    WeftError::Timeout { timeout_ms, .. } => {
                        self.timed_out += 1;
                        self.timeout_ms = self.timeout_ms.max(*timeout_ms);
                    }
                    WeftError::Cancelled => self.cancelled += 1,
                    _ => {}
                }
            }
        }
        let need = self.total / 2 + 1;
        match (self.join, result) {
            (JoinType::First, Ok(_)) | (JoinType::Success, Ok(_)) => {
                self.winner = Some(idx);
                Verdict::Succeeded
            }
            (JoinType::First, Err(e)) | (JoinType::Wait, Err(e)) => Verdict::Failed(clone_error(e)),
            (JoinType::Wait, Ok(_)) if self.ok == self.total => Verdict::Succeeded,
            (JoinType::Success, Err(e)) if self.failed == self.total => Verdict::Failed(self.aggregate(
                node,
                format!("all {} branches failed, last error: {}", self.total, e),
                e.is_retryable(),
            )),
            (JoinType::Majority, _) if self.ok >= need => Verdict::Succeeded,
            (JoinType::Majority, Err(e)) if self.failed > self.total - need => Verdict::Failed(self.aggregate(
                node,
                format!(
                    "majority unreachable: {} of {} branches failed, last error: {}",
                    self.failed, self.total, e
                ),
                e.is_retryable(),
            )),
            _ => Verdict::Pending,
        }
    }

    /// A join lost to failures keeps the failures' kind when they all agree.
    fn aggregate(&self, node: &NodeDef, detail: String, retryable: bool) -> WeftError {
        if self.timed_out == self.failed {
            WeftError::Timeout {
                target: format!("node {} ({})", node.id, detail),
                timeout_ms: self.timeout_ms,
            }
        } else if self.cancelled == self.failed {
            WeftError::Cancelled
        } else {
            WeftError::node(&node.id, node.label(), detail, retryable)
        }
    }
}

/// Errors are not `Clone`; rebuild the parts the engine inspects.
fn clone_error(err: &WeftError) -> WeftError {
    match err {
        WeftError::Cancelled => WeftError::Cancelled,
        WeftError::Timeout { target, timeout_ms } => WeftError::Timeout {
            target: target.clone(),
            timeout_ms: *timeout_ms,
        },
        WeftError::NodeExecution {
            node_id,
            node_name,
            message,
            retryable,
        } => WeftError::node(node_id, node_name, message, *retryable),
        other => WeftError::Agent(other.to_string()),
    }
}

fn branch_status(result: &Result<AgentOutput>) -> RunStatus {
    match result {
        Ok(_) => RunStatus::Completed,
        Err(e) if e.is_timeout() => RunStatus::Timeout,
        Err(e) if e.is_cancelled() => RunStatus::Cancelled,
        Err(_) => RunStatus::Failed,
    }
}

/// Run `branches` concurrently through the dispatcher and reconcile them
/// with `join`. At most `limit` branches are in flight at once. Once the join
/// is decided the remaining branches are cancelled and harvested.
///
/// Returns the node outputs on success, plus one trace record per branch.
pub(crate) async fn fan_out(
    dispatcher: Arc<dyn NodeDispatcher>,
    node: &NodeDef,
    branches: Vec<Branch>,
    join: JoinType,
    limit: usize,
    scope: &CancellationToken,
) -> (Result<HashMap<String, Value>>, Vec<NodeResult>) {
    if branches.is_empty() {
        let err = WeftError::node(&node.id, node.label(), "parallel node has no branches", false);
        return (Err(err), Vec::new());
    }

    let branch_scope = scope.child_token();
    let permits = Arc::new(Semaphore::new(limit.max(1)));
    let mut records: Vec<NodeResult> = branches
        .iter()
        .map(|b| NodeResult::named(&b.id, &b.name, "branch"))
        .collect();
    let ids: Vec<String> = branches.iter().map(|b| b.id.clone()).collect();
    let mut outputs: Vec<Option<Result<AgentOutput>>> = branches.iter().map(|_| None).collect();

    let mut set = JoinSet::new();
    for (idx, branch) in branches.into_iter().enumerate() {
        let dispatcher = dispatcher.clone();
        let permits = permits.clone();
        let cancel = branch_scope.child_token();
        let mut request = branch.request;
        request.cancel = cancel.clone();
        set.spawn(async move {
            let run = async {
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => return Err(WeftError::Cancelled),
                    p = permits.acquire_owned() => p
                        .map_err(|_| WeftError::InvalidState("branch limiter closed".into()))?,
                };
                dispatcher.dispatch(request).await
            };
            let result = AssertUnwindSafe(run)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(WeftError::Agent("branch panicked".into())));
            (idx, result)
        });
    }

    let mut tally = Tally::new(join, ids.len());
    let mut decision: Option<Result<()>> = None;

    while let Some(joined) = set.join_next().await {
        let Ok((idx, result)) = joined else { continue };
        if decision.is_none() && scope.is_cancelled() {
            // Cancelled from above; the branch errors are not the join's verdict.
            decision = Some(Err(WeftError::Cancelled));
            branch_scope.cancel();
        } else if decision.is_none() {
            match tally.observe(idx, &result, node) {
                Verdict::Pending => {}
                Verdict::Succeeded => decision = Some(Ok(())),
                Verdict::Failed(e) => decision = Some(Err(e)),
            }
            if decision.is_some() && !set.is_empty() {
                debug!(node_id = %node.id, outstanding = set.len(), "Join decided, cancelling remaining branches");
                branch_scope.cancel();
            }
        }
        outputs[idx] = Some(result);
    }

    for (record, output) in records.iter_mut().zip(&outputs) {
        match output {
            Some(result) => {
                if let Ok(out) = result {
                    record.outputs.insert("content".into(), json!(out.content));
                }
                if let Err(e) = result {
                    record.error = Some(e.to_string());
                }
                record.finish(branch_status(result));
            }
            None => record.finish(RunStatus::Cancelled),
        }
    }

    // Every branch was harvested without a verdict only if some task vanished.
    let decision = decision.unwrap_or_else(|| {
        Err(WeftError::node(&node.id, node.label(), "branches ended without a join decision", true))
    });
    if let Err(e) = decision {
        return (Err(e), records);
    }

    let mut results = Map::new();
    for (id, output) in ids.iter().zip(&outputs) {
        if let Some(Ok(out)) = output {
            results.insert(id.clone(), json!(out.content));
        }
    }

    let mut node_outputs = HashMap::new();
    let content = match tally.winner {
        Some(w) => {
            node_outputs.insert("winner".to_string(), json!(ids[w]));
            results.get(&ids[w]).cloned().unwrap_or(Value::Null)
        }
        None => Value::Object(results.clone()),
    };
    node_outputs.insert("content".to_string(), content);
    node_outputs.insert("results".to_string(), Value::Object(results));
    node_outputs.insert("succeeded".to_string(), json!(tally.ok));
    node_outputs.insert("failed".to_string(), json!(tally.failed));
    (Ok(node_outputs), records)
}
