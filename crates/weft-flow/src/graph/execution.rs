use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use weft_core::error::{ErrorKind, Result, WeftError};
use weft_core::types::{RunStatus, SessionId};

use super::definition::{NodeDef, WorkflowDefinition};
use super::variables::Variables;

/// Trace record of one node (or branch / iteration) execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: String,
    pub node_name: String,
    pub node_type: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    /// Branch or iteration results of composite nodes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeResult>,
}

impl NodeResult {
    pub fn started(node: &NodeDef) -> Self {
        Self::named(&node.id, node.label(), node.kind.type_name())
    }

    pub fn named(id: &str, name: &str, node_type: &str) -> Self {
        Self {
            node_id: id.to_string(),
            node_name: name.to_string(),
            node_type: node_type.to_string(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: 0,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            error: None,
            retry_count: 0,
            children: Vec::new(),
        }
    }

    /// Close the record with a final status.
    pub fn finish(&mut self, status: RunStatus) {
        let now = Utc::now();
        self.status = status;
        self.ended_at = Some(now);
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
    }

    pub fn content(&self) -> Option<&Value> {
        self.outputs.get("content")
    }
}

/// A structured error attributed to a node (or to the execution itself).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub retryable: bool,
}

impl WorkflowError {
    pub fn for_node(node: &NodeDef, err: &WeftError) -> Self {
        Self {
            node_id: Some(node.id.clone()),
            node_name: Some(node.label().to_string()),
            kind: err.kind(),
            message: err.to_string(),
            timestamp: Utc::now(),
            retryable: err.is_retryable(),
        }
    }

    pub fn for_execution(err: &WeftError) -> Self {
        Self {
            node_id: None,
            node_name: None,
            kind: err.kind(),
            message: err.to_string(),
            timestamp: Utc::now(),
            retryable: err.is_retryable(),
        }
    }
}

/// Final report of an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub outputs: HashMap<String, Value>,
    pub errors: Vec<WorkflowError>,
    pub warnings: Vec<String>,
    /// Node results in execution order.
    pub trace: Vec<NodeResult>,
}

impl WorkflowResult {
    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name)
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeResult> {
        self.trace.iter().find(|r| r.node_id == node_id)
    }

    pub fn visited(&self, node_id: &str) -> bool {
        self.node(node_id).is_some()
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Lightweight listing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub current_nodes: Vec<String>,
}

struct ExecutionState {
    status: RunStatus,
    variables: Variables,
    completed: HashSet<String>,
    failed: HashSet<String>,
    results: HashMap<String, NodeResult>,
    order: Vec<String>,
    current: Vec<String>,
    errors: Vec<WorkflowError>,
    warnings: Vec<String>,
    outputs: HashMap<String, Value>,
    session_id: Option<SessionId>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

/// Mutable state of one run. All writes go through the single state lock.
pub struct WorkflowExecution {
    id: String,
    definition: Arc<WorkflowDefinition>,
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
    status_tx: watch::Sender<RunStatus>,
    state: Mutex<ExecutionState>,
}

impl WorkflowExecution {
    pub fn new(
        id: impl Into<String>,
        definition: Arc<WorkflowDefinition>,
        variables: Variables,
        cancel: CancellationToken,
    ) -> Self {
        let (paused, _) = watch::channel(false);
        let (status_tx, _) = watch::channel(RunStatus::Pending);
        Self {
            id: id.into(),
            definition,
            cancel,
            paused,
            status_tx,
            state: Mutex::new(ExecutionState {
                status: RunStatus::Pending,
                variables,
                completed: HashSet::new(),
                failed: HashSet::new(),
                results: HashMap::new(),
                order: Vec::new(),
                current: Vec::new(),
                errors: Vec::new(),
                warnings: Vec::new(),
                outputs: HashMap::new(),
                session_id: None,
                started_at: None,
                ended_at: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ExecutionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, state: &mut ExecutionState, status: RunStatus) {
        state.status = status;
        self.status_tx.send_replace(status);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn workflow_id(&self) -> &str {
        &self.definition.id
    }

    pub fn definition(&self) -> &Arc<WorkflowDefinition> {
        &self.definition
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn status(&self) -> RunStatus {
        self.state().status
    }

    pub fn variables(&self) -> Variables {
        self.state().variables.clone()
    }

    /// Mutate the variable bag under the execution lock.
    pub fn update_variables<R>(&self, f: impl FnOnce(&mut Variables) -> R) -> R {
        f(&mut self.state().variables)
    }

    pub fn set_session(&self, session_id: SessionId) {
        self.state().session_id = Some(session_id);
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.state().session_id.clone()
    }

    /// Pending → Running.
    pub fn mark_running(&self) -> Result<()> {
        let mut state = self.state();
        if state.status != RunStatus::Pending {
            return Err(WeftError::InvalidState(format!(
                "execution {} cannot start from {}",
                self.id, state.status
            )));
        }
        state.started_at = Some(Utc::now());
        self.set_status(&mut state, RunStatus::Running);
        Ok(())
    }

    pub fn set_current(&self, nodes: Vec<String>) {
        self.state().current = nodes;
    }

    /// Store a node's trace record. Completion is recorded at most once per
    /// node; a second completion is rejected.
    pub fn record_result(&self, result: NodeResult) -> bool {
        let mut state = self.state();
        if state.completed.contains(&result.node_id) {
            warn!(
                execution_id = %self.id,
                node_id = %result.node_id,
                "Node already completed, ignoring duplicate result"
            );
            return false;
        }
        match result.status {
            RunStatus::Completed | RunStatus::Skipped => {
                state.completed.insert(result.node_id.clone());
            }
            RunStatus::Failed | RunStatus::Timeout | RunStatus::Cancelled => {
                state.failed.insert(result.node_id.clone());
            }
            _ => {}
        }
        if !state.results.contains_key(&result.node_id) {
            state.order.push(result.node_id.clone());
        }
        state.results.insert(result.node_id.clone(), result);
        true
    }

    pub fn is_completed(&self, node_id: &str) -> bool {
        self.state().completed.contains(node_id)
    }

    pub fn node_result(&self, node_id: &str) -> Option<NodeResult> {
        self.state().results.get(node_id).cloned()
    }

    pub fn record_error(&self, error: WorkflowError) {
        self.state().errors.push(error);
    }

    pub fn add_warning(&self, warning: impl Into<String>) {
        self.state().warnings.push(warning.into());
    }

    pub fn set_outputs(&self, outputs: HashMap<String, Value>) {
        self.state().outputs = outputs;
    }

    /// Move to a terminal status. Returns false if already terminal.
    pub fn finish(&self, status: RunStatus) -> bool {
        let mut state = self.state();
        if state.status.is_terminal() {
            return false;
        }
        state.ended_at = Some(Utc::now());
        state.current.clear();
        self.set_status(&mut state, status);
        drop(state);
        // A paused run that gets cancelled must not stay parked.
        self.paused.send_replace(false);
        true
    }

    pub fn pause(&self) -> Result<()> {
        let mut state = self.state();
        match state.status {
            RunStatus::Running => {
                self.set_status(&mut state, RunStatus::Paused);
                self.paused.send_replace(true);
                Ok(())
            }
            other => Err(WeftError::InvalidState(format!(
                "cannot pause execution {} in status {}",
                self.id, other
            ))),
        }
    }

    pub fn resume(&self) -> Result<()> {
        let mut state = self.state();
        match state.status {
            RunStatus::Paused => {
                self.set_status(&mut state, RunStatus::Running);
                self.paused.send_replace(false);
                Ok(())
            }
            other => Err(WeftError::InvalidState(format!(
                "cannot resume execution {} in status {}",
                self.id, other
            ))),
        }
    }

    /// Park while paused. Returns `Cancelled` if the scope is cancelled.
    pub async fn wait_if_paused(&self) -> Result<()> {
        let mut rx = self.paused.subscribe();
        loop {
            if self.cancel.is_cancelled() {
                return Err(WeftError::Cancelled);
            }
            if !*rx.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(WeftError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Wait until the execution reaches a terminal status.
    pub async fn wait_terminal(&self) -> WorkflowResult {
        let mut rx = self.status_tx.subscribe();
        loop {
            if rx.borrow_and_update().is_terminal() {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.result()
    }

    /// Snapshot of the execution as a result report.
    pub fn result(&self) -> WorkflowResult {
        let state = self.state();
        let duration_ms = match (state.started_at, state.ended_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            (Some(start), None) => (Utc::now() - start).num_milliseconds().max(0) as u64,
            _ => 0,
        };
        WorkflowResult {
            execution_id: self.id.clone(),
            workflow_id: self.definition.id.clone(),
            status: state.status,
            session_id: state.session_id.clone(),
            started_at: state.started_at,
            ended_at: state.ended_at,
            duration_ms,
            outputs: state.outputs.clone(),
            errors: state.errors.clone(),
            warnings: state.warnings.clone(),
            trace: state
                .order
                .iter()
                .filter_map(|id| state.results.get(id).cloned())
                .collect(),
        }
    }

    pub fn summary(&self) -> ExecutionSummary {
        let state = self.state();
        ExecutionSummary {
            execution_id: self.id.clone(),
            workflow_id: self.definition.id.clone(),
            status: state.status,
            started_at: state.started_at,
            ended_at: state.ended_at,
            current_nodes: state.current.clone(),
        }
    }
}
