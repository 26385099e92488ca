//! HTTP server implementation using Axum.

use crate::admission::require_admission;
use crate::agent::AgentEvent;
use crate::error::{ApiError, ApiResult};
use crate::runner::{self, NewSession};
use crate::sandbox::{DeleteOutcome, SandboxManager};
use crate::state::{AppState, SessionInfo};
use crate::status::{self, ServerStatus, StatusBroadcaster};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    middleware,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

// Request/Response types
#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct CreateSessionRequest {
    name: Option<String>,
    user_id: Option<String>,
    sandbox_ttl_minutes: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionResponse {
    session_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionIdParams {
    session_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionQueryRequest {
    session_id: String,
    query: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OneshotRequest {
    query: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    session_id: String,
    result: String,
}

#[derive(Serialize)]
struct SuccessResponse {
    success: bool,
}

#[derive(Serialize)]
struct DeleteSessionResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    sandbox: Option<DeleteOutcome>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionStatusResponse {
    session_id: String,
    is_processing: bool,
    state: crate::state::AgentState,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshSandboxRequest {
    session_id: String,
    #[serde(default)]
    ttl_minutes: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshSandboxResponse {
    sandbox_id: String,
    ttl_minutes: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SandboxVersionResponse {
    sandbox_id: String,
    version: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SandboxPingResponse {
    sandbox_id: String,
    alive: bool,
}

/// Builds the application router. Run-starting routes sit behind the
/// exclusive-mode admission layer; everything else is always reachable.
pub fn build_router(state: AppState) -> Router {
    let gated = Router::new()
        .route("/sessions/create", post(create_session))
        .route("/sessions/query", post(query_session))
        .route("/oneshot/query", post(oneshot_query))
        .route("/oneshot/query/stream", post(oneshot_query_stream))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_admission,
        ));

    let open = Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/details", get(get_session))
        .route("/sessions/status", get(get_session_status))
        .route("/sessions/abort", post(abort_session))
        .route("/sessions/delete", post(delete_session))
        .route("/server/status", get(server_status))
        .route("/sandbox/refresh", post(refresh_sandbox))
        .route("/sandbox/version", get(sandbox_version))
        .route("/sandbox/ping", get(sandbox_ping));

    Router::new()
        .nest("/api/v1", gated.merge(open))
        .route("/socket", get(status::socket_handler))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) -> std::io::Result<()> {
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

async fn health() -> &'static str {
    "OK"
}

async fn create_session(
    State(state): State<AppState>,
    body: Option<Json<CreateSessionRequest>>,
) -> ApiResult<(StatusCode, Json<CreateSessionResponse>)> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let session_id = runner::create_session(
        &state,
        NewSession {
            name: req.name,
            user_id: req.user_id,
            sandbox_ttl_minutes: req.sandbox_ttl_minutes,
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(CreateSessionResponse { session_id })))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.list().await)
}

async fn get_session(
    State(state): State<AppState>,
    Query(params): Query<SessionIdParams>,
) -> ApiResult<Json<SessionInfo>> {
    state
        .sessions
        .info(&params.session_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::SessionNotFound(params.session_id.clone()))
}

async fn get_session_status(
    State(state): State<AppState>,
    Query(params): Query<SessionIdParams>,
) -> ApiResult<Json<SessionStatusResponse>> {
    let status = state
        .sessions
        .status(&params.session_id)
        .await
        .ok_or_else(|| ApiError::SessionNotFound(params.session_id.clone()))?;
    Ok(Json(SessionStatusResponse {
        session_id: params.session_id,
        is_processing: status.is_processing(),
        state: status.agent_state(),
    }))
}

async fn query_session(
    State(state): State<AppState>,
    Json(req): Json<SessionQueryRequest>,
) -> ApiResult<Json<QueryResponse>> {
    let result = runner::run_query(&state, &req.session_id, req.query, None).await?;
    Ok(Json(QueryResponse {
        session_id: req.session_id,
        result,
    }))
}

async fn abort_session(
    State(state): State<AppState>,
    Json(req): Json<SessionIdParams>,
) -> ApiResult<Json<SuccessResponse>> {
    let success = runner::abort_session(&state, &req.session_id).await?;
    Ok(Json(SuccessResponse { success }))
}

async fn delete_session(
    State(state): State<AppState>,
    Json(req): Json<SessionIdParams>,
) -> ApiResult<Json<DeleteSessionResponse>> {
    let sandbox = runner::delete_session(&state, &req.session_id).await?;
    Ok(Json(DeleteSessionResponse {
        success: true,
        sandbox,
    }))
}

async fn oneshot_query(
    State(state): State<AppState>,
    Json(req): Json<OneshotRequest>,
) -> ApiResult<Json<QueryResponse>> {
    info!("POST /oneshot/query");
    let running = runner::start_oneshot(
        &state,
        NewSession {
            name: req.name,
            user_id: req.user_id,
            sandbox_ttl_minutes: None,
        },
        req.query,
        None,
    )
    .await?;
    let session_id = running.session_id().to_string();
    let result = running.finish(&state).await?;
    Ok(Json(QueryResponse { session_id, result }))
}

async fn oneshot_query_stream(
    State(state): State<AppState>,
    Json(req): Json<OneshotRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    info!("POST /oneshot/query/stream");
    let (tx, rx) = mpsc::unbounded_channel();
    // The slot is claimed before the stream opens so a refused run still
    // answers with a plain status.
    let running = runner::start_oneshot(
        &state,
        NewSession {
            name: req.name,
            user_id: req.user_id,
            sandbox_ttl_minutes: None,
        },
        req.query,
        Some(tx.clone()),
    )
    .await?;

    tokio::spawn(async move {
        let final_event = match running.finish(&state).await {
            Ok(result) => AgentEvent::Result { result },
            Err(e) => AgentEvent::Error {
                message: e.to_string(),
            },
        };
        let _ = tx.send(final_event);
    });

    let events = stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let sse = Event::default()
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().data("{}"));
        Some((Ok::<_, Infallible>(sse), rx))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn server_status(State(state): State<AppState>) -> Json<ServerStatus> {
    Json(StatusBroadcaster::snapshot(&state.gate, &state.sessions).await)
}

/// Resolves the sandbox manager and the sandbox id owned by a session.
async fn session_sandbox(
    state: &AppState,
    session_id: &str,
) -> ApiResult<(Arc<SandboxManager>, String)> {
    let manager = state.sandbox.clone().ok_or(ApiError::SandboxDisabled)?;
    let info = state
        .sessions
        .info(session_id)
        .await
        .ok_or_else(|| ApiError::SessionNotFound(session_id.to_string()))?;
    let sandbox_id = info
        .sandbox_id
        .ok_or_else(|| ApiError::NoSandbox(session_id.to_string()))?;
    Ok((manager, sandbox_id))
}

async fn refresh_sandbox(
    State(state): State<AppState>,
    Json(req): Json<RefreshSandboxRequest>,
) -> ApiResult<Json<RefreshSandboxResponse>> {
    let (manager, sandbox_id) = session_sandbox(&state, &req.session_id).await?;
    let ttl_minutes = req.ttl_minutes.unwrap_or(manager.default_ttl_minutes());
    manager.refresh_instance_ttl(&sandbox_id, ttl_minutes).await?;
    Ok(Json(RefreshSandboxResponse {
        sandbox_id,
        ttl_minutes,
    }))
}

async fn sandbox_version(
    State(state): State<AppState>,
    Query(params): Query<SessionIdParams>,
) -> ApiResult<Json<SandboxVersionResponse>> {
    let (manager, sandbox_id) = session_sandbox(&state, &params.session_id).await?;
    let version = manager.get_image_version(&sandbox_id).await;
    Ok(Json(SandboxVersionResponse {
        sandbox_id,
        version,
    }))
}

async fn sandbox_ping(
    State(state): State<AppState>,
    Query(params): Query<SessionIdParams>,
) -> ApiResult<impl IntoResponse> {
    let (manager, sandbox_id) = session_sandbox(&state, &params.session_id).await?;
    let alive = manager.test_instance(&sandbox_id).await;
    Ok(Json(SandboxPingResponse { sandbox_id, alive }))
}
