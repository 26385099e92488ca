//! Boundary to the agent that actually executes a query.

use crate::error::AgentError;
use crate::state::{AgentState, SessionStatus};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::info;

/// Events streamed to one-shot stream clients.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AgentEvent {
    #[serde(rename_all = "camelCase")]
    Session { session_id: String },
    Progress { message: String },
    Result { result: String },
    Error { message: String },
}

/// What an agent gets to work with for one query.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub session_id: String,
    pub sandbox_url: Option<String>,
    pub status: SessionStatus,
    events: Option<mpsc::UnboundedSender<AgentEvent>>,
}

impl AgentContext {
    pub fn new(
        session_id: String,
        sandbox_url: Option<String>,
        status: SessionStatus,
        events: Option<mpsc::UnboundedSender<AgentEvent>>,
    ) -> Self {
        Self {
            session_id,
            sandbox_url,
            status,
            events,
        }
    }

    /// Forwards an event to a streaming client, if there is one.
    pub fn emit(&self, event: AgentEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    async fn run(&self, ctx: AgentContext, query: String) -> Result<String, AgentError>;
}

/// Forwards queries to an external agent worker over HTTP.
pub struct HttpAgent {
    http: Client,
    url: String,
}

#[derive(Deserialize)]
struct WorkerResponse {
    result: String,
}

impl HttpAgent {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Agent for HttpAgent {
    async fn run(&self, ctx: AgentContext, query: String) -> Result<String, AgentError> {
        ctx.status.set_agent_state(AgentState::Executing);
        ctx.emit(AgentEvent::Progress {
            message: "dispatched to agent worker".to_string(),
        });
        info!(session_id = %ctx.session_id, url = %self.url, "dispatching query to agent worker");

        let outcome: Result<String, AgentError> = async {
            let response = self
                .http
                .post(&self.url)
                .json(&json!({
                    "sessionId": ctx.session_id,
                    "query": query,
                    "sandboxUrl": ctx.sandbox_url,
                }))
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                return Err(AgentError::Worker {
                    status: status.as_u16(),
                    text: response.text().await.unwrap_or_default(),
                });
            }
            Ok(response.json::<WorkerResponse>().await?.result)
        }
        .await;

        ctx.status.set_agent_state(if outcome.is_ok() {
            AgentState::Ready
        } else {
            AgentState::Error
        });
        outcome
    }
}
