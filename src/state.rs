//! Shared application state and session bookkeeping.

use crate::agent::Agent;
use crate::config::ServerConfig;
use crate::gate::{now_millis, ExclusivityGate};
use crate::sandbox::SandboxManager;
use crate::status::StatusBroadcaster;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::RwLock;
use tokio::task::AbortHandle;

/// Lifecycle state reported by the agent driving a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    #[default]
    Ready,
    Executing,
    Paused,
    Error,
}

#[derive(Debug, Default)]
struct StatusInner {
    processing: bool,
    state: AgentState,
}

/// Processing flag and agent state of one session.
///
/// Clones share the same underlying status. The agent writes `state`; the
/// run path toggles `processing` around each query.
#[derive(Debug, Clone, Default)]
pub struct SessionStatus(Arc<Mutex<StatusInner>>);

impl SessionStatus {
    pub fn is_processing(&self) -> bool {
        self.lock().processing
    }

    pub fn agent_state(&self) -> AgentState {
        self.lock().state
    }

    pub fn set_agent_state(&self, state: AgentState) {
        self.lock().state = state;
    }

    pub(crate) fn set_processing(&self, processing: bool) {
        self.lock().processing = processing;
    }

    /// Marks the session as processing unless it already is.
    pub(crate) fn try_begin(&self) -> bool {
        let mut inner = self.lock();
        if inner.processing {
            return false;
        }
        inner.processing = true;
        true
    }

    fn lock(&self) -> MutexGuard<'_, StatusInner> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A session known to this server.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: String,
    pub name: Option<String>,
    pub status: SessionStatus,
    pub sandbox_id: Option<String>,
    pub sandbox_url: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
    abort: Option<AbortHandle>,
}

impl SessionHandle {
    pub fn new(id: String, name: Option<String>) -> Self {
        let now = now_millis();
        Self {
            id,
            name,
            status: SessionStatus::default(),
            sandbox_id: None,
            sandbox_url: None,
            created_at: now,
            updated_at: now,
            abort: None,
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            is_processing: self.status.is_processing(),
            state: self.status.agent_state(),
            sandbox_id: self.sandbox_id.clone(),
            sandbox_url: self.sandbox_url.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub name: Option<String>,
    pub is_processing: bool,
    pub state: AgentState,
    pub sandbox_id: Option<String>,
    pub sandbox_url: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// In-memory map of live sessions. Holds no I/O.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, handle: SessionHandle) {
        self.sessions.write().await.insert(handle.id.clone(), handle);
    }

    pub async fn remove(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.write().await.remove(id)
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn info(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.read().await.get(id).map(SessionHandle::info)
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<SessionInfo> = sessions.values().map(SessionHandle::info).collect();
        list.sort_by_key(|s| s.created_at);
        list
    }

    /// Status handles of every session, keyed by id.
    pub async fn statuses(&self) -> Vec<(String, SessionStatus)> {
        self.sessions
            .read()
            .await
            .values()
            .map(|s| (s.id.clone(), s.status.clone()))
            .collect()
    }

    pub async fn status(&self, id: &str) -> Option<SessionStatus> {
        self.sessions.read().await.get(id).map(|s| s.status.clone())
    }

    pub async fn set_sandbox(&self, id: &str, sandbox_id: String, sandbox_url: String) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(id) else {
            return false;
        };
        session.sandbox_id = Some(sandbox_id);
        session.sandbox_url = Some(sandbox_url);
        session.updated_at = now_millis();
        true
    }

    pub async fn touch(&self, id: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(id) {
            session.updated_at = now_millis();
        }
    }

    pub(crate) async fn set_abort(&self, id: &str, handle: Option<AbortHandle>) {
        if let Some(session) = self.sessions.write().await.get_mut(id) {
            session.abort = handle;
        }
    }

    pub(crate) async fn take_abort(&self, id: &str) -> Option<AbortHandle> {
        self.sessions
            .write()
            .await
            .get_mut(id)
            .and_then(|s| s.abort.take())
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<ExclusivityGate>,
    pub sessions: Arc<SessionRegistry>,
    pub broadcaster: Arc<StatusBroadcaster>,
    pub sandbox: Option<Arc<SandboxManager>>,
    pub agent: Arc<dyn Agent>,
}

impl AppState {
    pub fn new(config: &ServerConfig, agent: Arc<dyn Agent>) -> Self {
        let broadcaster = Arc::new(StatusBroadcaster::new(config.debug));
        let gate = ExclusivityGate::new(config.exclusive).with_listener(broadcaster.clone());
        Self {
            gate: Arc::new(gate),
            sessions: Arc::new(SessionRegistry::new()),
            broadcaster,
            sandbox: None,
            agent,
        }
    }

    pub fn with_sandbox(mut self, manager: Arc<SandboxManager>) -> Self {
        self.sandbox = Some(manager);
        self
    }
}
