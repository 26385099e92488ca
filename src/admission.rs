//! Exclusive-mode admission for run-starting endpoints.

use crate::error::conflict_response;
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;

/// Lets the request through when the gate can accept a new run, otherwise
/// answers `409` with the id of the running session.
pub async fn require_admission(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if state.gate.can_accept_new_request() {
        return next.run(req).await;
    }

    let running_session_id = state.gate.running_session_id();
    debug!(
        path = %req.uri().path(),
        running_session_id = ?running_session_id,
        "request refused by exclusive mode"
    );
    conflict_response(running_session_id)
}
