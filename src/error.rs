//! Error types for the sandbox protocol, the agent seam and the HTTP surface.

use crate::sandbox::SandboxState;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Failures talking to the remote sandbox host.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox create response (status {status}) is missing the instance name header")]
    MissingInstanceName { status: u16 },
    #[error("sandbox {operation} failed with status {status}: {text}")]
    Status {
        operation: &'static str,
        status: u16,
        text: String,
    },
    #[error("invalid sandbox base url '{0}'")]
    InvalidBaseUrl(String),
    #[error("sandbox instance {id} is {state:?}")]
    Unavailable { id: String, state: SandboxState },
    #[error("failed to obtain sandbox token: {0}")]
    Token(String),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

impl SandboxError {
    /// True when the request never produced an HTTP response.
    pub fn is_transport(&self) -> bool {
        matches!(self, SandboxError::Transport(_))
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;

/// Failures reported by an agent implementation.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent failed: {0}")]
    Failed(String),
    #[error("agent worker returned status {status}: {text}")]
    Worker { status: u16, text: String },
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// Body returned whenever exclusive mode blocks a run-starting request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictBody {
    pub error: String,
    pub running_session_id: Option<String>,
}

impl ConflictBody {
    pub fn new(running_session_id: Option<String>) -> Self {
        Self {
            error: "Server is in exclusive mode and another session is currently running"
                .to_string(),
            running_session_id,
        }
    }
}

/// Conflict response shared by the admission middleware and the run path.
pub fn conflict_response(running_session_id: Option<String>) -> Response {
    (
        StatusCode::CONFLICT,
        Json(ConflictBody::new(running_session_id)),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("session {0} is already processing a query")]
    SessionBusy(String),
    #[error("session {0} has no sandbox instance")]
    NoSandbox(String),
    #[error("sandbox support is not configured")]
    SandboxDisabled,
    #[error("session {0} was aborted")]
    Aborted(String),
    #[error("exclusive mode: session {running_session_id:?} is running")]
    Conflict { running_session_id: Option<String> },
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Agent(#[from] AgentError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Conflict { running_session_id } = self {
            return conflict_response(running_session_id);
        }

        let (status, code) = match &self {
            ApiError::SessionNotFound(_) => (StatusCode::NOT_FOUND, "session_not_found"),
            ApiError::SessionBusy(_) => (StatusCode::CONFLICT, "session_busy"),
            ApiError::NoSandbox(_) => (StatusCode::NOT_FOUND, "no_sandbox"),
            ApiError::SandboxDisabled => (StatusCode::SERVICE_UNAVAILABLE, "sandbox_disabled"),
            ApiError::Aborted(_) => (StatusCode::CONFLICT, "aborted"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            ApiError::Sandbox(_) => (StatusCode::BAD_GATEWAY, "sandbox_error"),
            ApiError::Agent(_) => (StatusCode::INTERNAL_SERVER_ERROR, "agent_error"),
            ApiError::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
        };

        let body = ErrorBody {
            code: code.to_string(),
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
