//! Session creation, query execution and teardown.
//!
//! A query holds the run slot through a [`RunSlot`] guard owned by the task
//! executing it, so completion, failure and abort each release the slot
//! exactly once.

use crate::agent::{AgentContext, AgentEvent};
use crate::error::{AgentError, ApiError, ApiResult};
use crate::gate::ExclusivityGate;
use crate::sandbox::DeleteOutcome;
use crate::sandbox_client::CreateOptions;
use crate::state::{AppState, SessionHandle, SessionStatus};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Holds the run slot and the processing flag for one running query.
struct RunSlot {
    gate: Arc<ExclusivityGate>,
    status: SessionStatus,
    session_id: String,
}

impl RunSlot {
    fn acquire(gate: Arc<ExclusivityGate>, status: SessionStatus, session_id: &str) -> ApiResult<Self> {
        if !status.try_begin() {
            return Err(ApiError::SessionBusy(session_id.to_string()));
        }
        if let Err(running) = gate.try_set_running_session(session_id) {
            status.set_processing(false);
            return Err(ApiError::Conflict {
                running_session_id: Some(running),
            });
        }
        Ok(Self {
            gate,
            status,
            session_id: session_id.to_string(),
        })
    }
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        self.status.set_processing(false);
        self.gate.clear_running_session(&self.session_id);
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub name: Option<String>,
    pub user_id: Option<String>,
    pub sandbox_ttl_minutes: Option<u32>,
}

/// Registers a session and, when sandboxes are configured, provisions its
/// instance. A failed provisioning drops the session again.
pub async fn create_session(state: &AppState, request: NewSession) -> ApiResult<String> {
    let session_id = uuid::Uuid::new_v4().to_string();
    state
        .sessions
        .insert(SessionHandle::new(session_id.clone(), request.name))
        .await;

    if let Some(manager) = &state.sandbox {
        let options = CreateOptions {
            ttl_minutes: request.sandbox_ttl_minutes,
            user_id: request.user_id,
            session_id: Some(session_id.clone()),
            allocation_strategy: None,
        };
        match manager.create_instance(options).await {
            Ok(instance) => {
                state
                    .sessions
                    .set_sandbox(&session_id, instance.id, instance.url)
                    .await;
            }
            Err(e) => {
                state.sessions.remove(&session_id).await;
                return Err(e.into());
            }
        }
    }

    info!("Created session: {}", session_id);
    Ok(session_id)
}

/// A query that holds the run slot and is executing on its own task.
pub struct RunningQuery {
    session_id: String,
    task: JoinHandle<Result<String, AgentError>>,
}

/// Claims the run slot for `session_id` and starts the agent. Fails without
/// side effects when the session is unknown, busy, or the gate is taken.
pub async fn start_query(
    state: &AppState,
    session_id: &str,
    query: String,
    events: Option<mpsc::UnboundedSender<AgentEvent>>,
) -> ApiResult<RunningQuery> {
    let info = state
        .sessions
        .info(session_id)
        .await
        .ok_or_else(|| ApiError::SessionNotFound(session_id.to_string()))?;
    let status = state
        .sessions
        .status(session_id)
        .await
        .ok_or_else(|| ApiError::SessionNotFound(session_id.to_string()))?;

    let slot = RunSlot::acquire(state.gate.clone(), status.clone(), session_id)?;
    let ctx = AgentContext::new(session_id.to_string(), info.sandbox_url, status, events);
    let agent = state.agent.clone();

    let (registered_tx, registered_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let _slot = slot;
        // The agent starts only once the abort handle is reachable.
        let _ = registered_rx.await;
        agent.run(ctx, query).await
    });
    state
        .sessions
        .set_abort(session_id, Some(task.abort_handle()))
        .await;
    state.sessions.touch(session_id).await;
    let _ = registered_tx.send(());

    Ok(RunningQuery {
        session_id: session_id.to_string(),
        task,
    })
}

impl RunningQuery {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Waits for the agent and maps its outcome.
    pub async fn finish(self, state: &AppState) -> ApiResult<String> {
        let session_id = self.session_id;
        let joined = self.task.await;
        state.sessions.set_abort(&session_id, None).await;

        match joined {
            Ok(Ok(result)) => {
                info!(session_id = %session_id, "query finished");
                Ok(result)
            }
            Ok(Err(e)) => {
                error!(session_id = %session_id, "query failed: {}", e);
                Err(e.into())
            }
            Err(e) if e.is_cancelled() => {
                info!(session_id = %session_id, "query aborted");
                Err(ApiError::Aborted(session_id))
            }
            Err(e) => Err(ApiError::Internal(e.to_string())),
        }
    }
}

/// Runs `query` inside an existing session and waits for the agent.
pub async fn run_query(
    state: &AppState,
    session_id: &str,
    query: String,
    events: Option<mpsc::UnboundedSender<AgentEvent>>,
) -> ApiResult<String> {
    start_query(state, session_id, query, events)
        .await?
        .finish(state)
        .await
}

/// Creates a throwaway session and starts `query` in it. When the query
/// cannot start the session and its sandbox are torn down again.
pub async fn start_oneshot(
    state: &AppState,
    request: NewSession,
    query: String,
    events: Option<mpsc::UnboundedSender<AgentEvent>>,
) -> ApiResult<RunningQuery> {
    let session_id = create_session(state, request).await?;
    if let Some(events) = &events {
        let _ = events.send(AgentEvent::Session {
            session_id: session_id.clone(),
        });
    }
    match start_query(state, &session_id, query, events).await {
        Ok(running) => Ok(running),
        Err(e) => {
            warn!(session_id = %session_id, "one-shot query could not start: {}", e);
            if let Err(cleanup) = delete_session(state, &session_id).await {
                error!(session_id = %session_id, "failed to discard one-shot session: {}", cleanup);
            }
            Err(e)
        }
    }
}

/// Cancels the query running in `session_id`. Returns whether one was
/// running.
pub async fn abort_session(state: &AppState, session_id: &str) -> ApiResult<bool> {
    if !state.sessions.contains(session_id).await {
        return Err(ApiError::SessionNotFound(session_id.to_string()));
    }
    match state.sessions.take_abort(session_id).await {
        Some(handle) => {
            handle.abort();
            info!(session_id = %session_id, "abort requested");
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Aborts any running query, tears down the session's sandbox and forgets
/// the session. A sandbox that could not be confirmed gone keeps the
/// session registered and surfaces the error.
pub async fn delete_session(state: &AppState, session_id: &str) -> ApiResult<Option<DeleteOutcome>> {
    let info = state
        .sessions
        .info(session_id)
        .await
        .ok_or_else(|| ApiError::SessionNotFound(session_id.to_string()))?;

    if let Some(handle) = state.sessions.take_abort(session_id).await {
        handle.abort();
    }

    let outcome = match (&state.sandbox, info.sandbox_id) {
        (Some(manager), Some(sandbox_id)) => {
            Some(manager.delete_instance(&sandbox_id).await?)
        }
        _ => None,
    };

    state.sessions.remove(session_id).await;
    info!("Deleted session: {}", session_id);
    Ok(outcome)
}
