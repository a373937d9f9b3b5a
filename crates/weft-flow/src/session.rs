use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use futures::future::BoxFuture;
use tracing::debug;

use weft_core::error::Result;
use weft_core::traits::SessionStore;
use weft_core::types::{SessionId, WorkflowSession};

/// Process-local session store.
///
/// Sessions keep their run history bounded by `history_limit`. Closed
/// sessions stay readable but are never handed out again by
/// [`SessionStore::get_or_create_session`].
pub struct InMemorySessionStore {
    history_limit: usize,
    sessions: Mutex<HashMap<SessionId, WorkflowSession>>,
}

impl InMemorySessionStore {
    pub fn new(history_limit: usize) -> Self {
        Self {
            history_limit,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Sessions belonging to a workflow, oldest first.
    pub fn list(&self, workflow_id: &str) -> Vec<WorkflowSession> {
        let mut sessions: Vec<WorkflowSession> = self
            .lock()
            .values()
            .filter(|s| s.workflow_id == workflow_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, WorkflowSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self, workflow_id: &str) -> WorkflowSession {
        let session = WorkflowSession::new(workflow_id, self.history_limit);
        debug!(session_id = %session.id, workflow_id, "Session opened");
        self.lock().insert(session.id.clone(), session.clone());
        session
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(100)
    }
}

impl SessionStore for InMemorySessionStore {
    fn create_session(&self, workflow_id: &str) -> BoxFuture<'_, Result<WorkflowSession>> {
        let session = self.open(workflow_id);
        Box::pin(async move { Ok(session) })
    }

    fn get_session(&self, id: &SessionId) -> BoxFuture<'_, Result<Option<WorkflowSession>>> {
        let session = self.lock().get(id).cloned();
        Box::pin(async move { Ok(session) })
    }

    fn save_session(&self, mut session: WorkflowSession) -> BoxFuture<'_, Result<()>> {
        session.updated_at = Utc::now();
        self.lock().insert(session.id.clone(), session);
        Box::pin(async { Ok(()) })
    }

    fn close_session(&self, id: &SessionId) -> BoxFuture<'_, Result<()>> {
        if let Some(session) = self.lock().get_mut(id) {
            if !session.closed {
                session.closed = true;
                session.updated_at = Utc::now();
                debug!(session_id = %id, "Session closed");
            }
        }
        Box::pin(async { Ok(()) })
    }

    fn get_or_create_session(&self, workflow_id: &str) -> BoxFuture<'_, Result<WorkflowSession>> {
        let existing = self
            .lock()
            .values()
            .filter(|s| s.workflow_id == workflow_id && !s.closed)
            .max_by_key(|s| s.created_at)
            .cloned();
        let session = existing.unwrap_or_else(|| self.open(workflow_id));
        Box::pin(async move { Ok(session) })
    }
}
