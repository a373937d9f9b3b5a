use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Lifecycle event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowEventKind {
    #[serde(rename = "workflow.started")]
    WorkflowStarted,
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted,
    #[serde(rename = "workflow.failed")]
    WorkflowFailed,
    #[serde(rename = "workflow.cancelled")]
    WorkflowCancelled,
    #[serde(rename = "workflow.paused")]
    WorkflowPaused,
    #[serde(rename = "workflow.resumed")]
    WorkflowResumed,
    #[serde(rename = "node.started")]
    NodeStarted,
    #[serde(rename = "node.completed")]
    NodeCompleted,
    #[serde(rename = "node.failed")]
    NodeFailed,
    #[serde(rename = "node.skipped")]
    NodeSkipped,
}

impl WorkflowEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkflowStarted => "workflow.started",
            Self::WorkflowCompleted => "workflow.completed",
            Self::WorkflowFailed => "workflow.failed",
            Self::WorkflowCancelled => "workflow.cancelled",
            Self::WorkflowPaused => "workflow.paused",
            Self::WorkflowResumed => "workflow.resumed",
            Self::NodeStarted => "node.started",
            Self::NodeCompleted => "node.completed",
            Self::NodeFailed => "node.failed",
            Self::NodeSkipped => "node.skipped",
        }
    }
}

impl std::fmt::Display for WorkflowEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle event published by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    #[serde(rename = "type")]
    pub kind: WorkflowEventKind,
    pub execution_id: String,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl WorkflowEvent {
    pub fn new(
        kind: WorkflowEventKind,
        execution_id: impl Into<String>,
        workflow_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            execution_id: execution_id.into(),
            workflow_id: workflow_id.into(),
            node_id: None,
            timestamp: Utc::now(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Callback invoked for each matching event.
pub type EventHandler = Arc<dyn Fn(&WorkflowEvent) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Event bus using tokio broadcast channel.
/// Raw subscribers receive all events; handler subscriptions filter by kind
/// and are delivered asynchronously from their own task.
pub struct EventBus {
    tx: broadcast::Sender<WorkflowEvent>,
    next_id: AtomicU64,
    handlers: Mutex<HashMap<SubscriptionId, CancellationToken>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }

    /// Register a handler for the given kinds (all kinds when empty).
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe_to(
        &self,
        kinds: Vec<WorkflowEventKind>,
        handler: EventHandler,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let token = CancellationToken::new();
        let mut rx = self.tx.subscribe();
        let stop = token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(event) => {
                            if kinds.is_empty() || kinds.contains(&event.kind) {
                                handler(&event);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Event handler lagged, events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, token);
        id
    }

    /// Remove a handler subscription. Returns false if it was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let token = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        let handlers = self
            .handlers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for token in handlers.values() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_raw_subscriber_receives_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(WorkflowEvent::new(WorkflowEventKind::WorkflowStarted, "e1", "wf"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, WorkflowEventKind::WorkflowStarted);
        assert_eq!(event.execution_id, "e1");
    }

    #[tokio::test]
    async fn test_handler_filters_by_kind() {
        let bus = EventBus::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        bus.subscribe_to(
            vec![WorkflowEventKind::NodeCompleted],
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        // Let the handler task start listening.
        tokio::task::yield_now().await;

        bus.publish(WorkflowEvent::new(WorkflowEventKind::WorkflowStarted, "e1", "wf"));
        bus.publish(WorkflowEvent::new(WorkflowEventKind::NodeCompleted, "e1", "wf").with_node("a"));
        bus.publish(WorkflowEvent::new(WorkflowEventKind::NodeCompleted, "e1", "wf").with_node("b"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let id = bus.subscribe_to(
            vec![],
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        tokio::time::sleep(Duration::from_millis(10)).await;

        bus.publish(WorkflowEvent::new(WorkflowEventKind::WorkflowStarted, "e1", "wf"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_kind_serializes_dotted() {
        let json = serde_json::to_string(&WorkflowEventKind::NodeCompleted).unwrap();
        assert_eq!(json, "\"node.completed\"");
    }
}
