//! HTTP client for the remote sandbox host.
//!
//! Every lifecycle operation is a request against `/v1/ping`, either on the
//! provisioning endpoint (create) or on the instance's own host, with the
//! directive carried in `X-Faas-*` headers.

use crate::error::{SandboxError, SandboxResult};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const HEADER_CREATE_SANDBOX: &str = "X-Faas-Create-Sandbox";
pub const HEADER_DELETE_SANDBOX: &str = "X-Faas-Delete-Sandbox";
pub const HEADER_TTL_MINUTES: &str = "X-Faas-Sandbox-TTL-Minutes";
pub const HEADER_INSTANCE_NAME: &str = "X-Faas-Instance-Name";
pub const HEADER_USER_ID: &str = "X-Faas-User-Id";
pub const HEADER_SESSION_ID: &str = "X-Faas-Session-Id";
pub const HEADER_ALLOCATION_STRATEGY: &str = "X-Faas-Allocation-Strategy";
pub const HEADER_JWT_TOKEN: &str = "x-jwt-token";

/// Error code the host reports when probing an instance that does not exist.
pub const INSTANCE_NOT_FOUND_CODE: &str = "instance_not_found";
/// Error text the host returns when a delete races its own TTL cleanup.
pub const TTL_DELETE_FAILED_SIGNATURE: &str = "ttl delete failed";

const PING_PATH: &str = "/v1/ping";
const OPENAPI_PATH: &str = "/v1/openapi.json";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Source of the token sent in `x-jwt-token`.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> SandboxResult<String>;
}

/// A fixed token.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> SandboxResult<String> {
        Ok(self.0.clone())
    }
}

/// Extra attributes attached to a provisioning request.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub ttl_minutes: Option<u32>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub allocation_strategy: Option<String>,
}

/// How the host answered a delete directive that produced a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteReply {
    Deleted,
    /// The instance was already gone; carries the host's explanation.
    AlreadyGone(String),
}

#[derive(Clone)]
pub struct SandboxClient {
    http: Client,
    base_url: Url,
    tokens: Arc<dyn TokenProvider>,
}

impl SandboxClient {
    pub fn new(base_url: &str, tokens: Arc<dyn TokenProvider>) -> SandboxResult<Self> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Self::with_http_client(http, base_url, tokens)
    }

    pub fn with_http_client(
        http: Client,
        base_url: &str,
        tokens: Arc<dyn TokenProvider>,
    ) -> SandboxResult<Self> {
        let base_url =
            Url::parse(base_url).map_err(|_| SandboxError::InvalidBaseUrl(base_url.to_string()))?;
        if base_url.host_str().is_none() {
            return Err(SandboxError::InvalidBaseUrl(base_url.to_string()));
        }
        Ok(Self {
            http,
            base_url,
            tokens,
        })
    }

    /// `{scheme}://{id}.{host}[:port]` of the configured base URL.
    pub fn instance_url(&self, id: &str) -> String {
        let host = self.base_url.host_str().unwrap_or_default();
        match self.base_url.port() {
            Some(port) => format!("{}://{}.{}:{}", self.base_url.scheme(), id, host, port),
            None => format!("{}://{}.{}", self.base_url.scheme(), id, host),
        }
    }

    fn provision_url(&self) -> String {
        format!("{}{}", self.base_url.as_str().trim_end_matches('/'), PING_PATH)
    }

    /// Asks the host for a new instance and returns its name.
    pub async fn create(&self, ttl_minutes: u32, options: &CreateOptions) -> SandboxResult<String> {
        let token = self.tokens.token().await?;
        let mut request = self
            .http
            .post(self.provision_url())
            .header(HEADER_CREATE_SANDBOX, "true")
            .header(HEADER_TTL_MINUTES, ttl_minutes.to_string())
            .header(HEADER_JWT_TOKEN, token);
        if let Some(user_id) = &options.user_id {
            request = request.header(HEADER_USER_ID, user_id);
        }
        if let Some(session_id) = &options.session_id {
            request = request.header(HEADER_SESSION_ID, session_id);
        }
        if let Some(strategy) = &options.allocation_strategy {
            request = request.header(HEADER_ALLOCATION_STRATEGY, strategy);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error("create", response).await);
        }

        response
            .headers()
            .get(HEADER_INSTANCE_NAME)
            .and_then(|v| v.to_str().ok())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .ok_or(SandboxError::MissingInstanceName {
                status: status.as_u16(),
            })
    }

    /// Sends the delete directive. A transport failure is returned as
    /// [`SandboxError::Transport`]; unexpected statuses as
    /// [`SandboxError::Status`].
    pub async fn delete(&self, id: &str) -> SandboxResult<DeleteReply> {
        let token = self.tokens.token().await?;
        let response = self
            .http
            .delete(format!("{}{}", self.instance_url(id), PING_PATH))
            .header(HEADER_DELETE_SANDBOX, "true")
            .header(HEADER_INSTANCE_NAME, id)
            .header(HEADER_JWT_TOKEN, token)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(DeleteReply::Deleted);
        }

        let text = response.text().await.unwrap_or_default();
        let message = error_message(&text);
        if status == StatusCode::NOT_FOUND {
            return Ok(DeleteReply::AlreadyGone(format!(
                "sandbox instance {} not found: {}",
                id, message
            )));
        }
        if message.to_lowercase().contains(TTL_DELETE_FAILED_SIGNATURE) {
            return Ok(DeleteReply::AlreadyGone(format!(
                "sandbox instance {} already removed by ttl: {}",
                id, message
            )));
        }

        Err(SandboxError::Status {
            operation: "delete",
            status: status.as_u16(),
            text: message,
        })
    }

    pub async fn refresh(&self, id: &str, ttl_minutes: u32) -> SandboxResult<()> {
        let token = self.tokens.token().await?;
        let response = self
            .http
            .patch(format!("{}{}", self.instance_url(id), PING_PATH))
            .header(HEADER_TTL_MINUTES, ttl_minutes.to_string())
            .header(HEADER_INSTANCE_NAME, id)
            .header(HEADER_JWT_TOKEN, token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error("refresh", response).await);
        }
        Ok(())
    }

    /// Unauthenticated probe of the instance root. `true` only when the host
    /// positively reports the instance as missing.
    pub async fn probe_not_exist(&self, id: &str) -> bool {
        let response = match self.http.get(format!("{}/", self.instance_url(id))).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(instance = %id, "existence probe failed: {}", e);
                return false;
            }
        };
        if response.status() != StatusCode::INTERNAL_SERVER_ERROR {
            return false;
        }
        match response.json::<Value>().await {
            Ok(body) => body.get("error_code").and_then(Value::as_str) == Some(INSTANCE_NOT_FOUND_CODE),
            Err(_) => false,
        }
    }

    pub async fn image_version(&self, id: &str) -> SandboxResult<String> {
        let response = self
            .http
            .get(format!("{}{}", self.instance_url(id), OPENAPI_PATH))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_error("version", response).await);
        }
        let openapi: Value = response.json().await?;
        Ok(openapi
            .pointer("/info/version")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    pub async fn ping(&self, id: &str) -> SandboxResult<()> {
        let response = self
            .http
            .get(format!("{}{}", self.instance_url(id), PING_PATH))
            .timeout(PING_TIMEOUT)
            .send()
            .await?;
        if response.status().is_client_error() || response.status().is_server_error() {
            return Err(status_error("ping", response).await);
        }
        Ok(())
    }
}

async fn status_error(operation: &'static str, response: Response) -> SandboxError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let text = if text.is_empty() {
        status.canonical_reason().unwrap_or("unknown").to_string()
    } else {
        text
    };
    SandboxError::Status {
        operation,
        status: status.as_u16(),
        text,
    }
}

/// Pulls the human readable message out of a JSON error body, falling back
/// to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            ["error", "message", "msg"]
                .iter()
                .find_map(|key| v.get(*key).and_then(Value::as_str).map(str::to_string))
        })
        .unwrap_or_else(|| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> SandboxClient {
        SandboxClient::new(base, Arc::new(StaticToken("t".into()))).unwrap()
    }

    #[test]
    fn instance_url_uses_base_domain() {
        assert_eq!(
            client("https://faas.example.com").instance_url("inst-1"),
            "https://inst-1.faas.example.com"
        );
        assert_eq!(
            client("http://sandbox.test:8080/").instance_url("abc"),
            "http://abc.sandbox.test:8080"
        );
    }

    #[test]
    fn provision_url_appends_ping_path() {
        assert_eq!(
            client("https://faas.example.com/").provision_url(),
            "https://faas.example.com/v1/ping"
        );
    }

    #[test]
    fn rejects_unparseable_base_url() {
        let err = SandboxClient::new("not a url", Arc::new(StaticToken("t".into())));
        assert!(matches!(err, Err(SandboxError::InvalidBaseUrl(_))));
    }

    #[test]
    fn error_message_prefers_json_fields() {
        assert_eq!(error_message(r#"{"error":"TTL delete failed"}"#), "TTL delete failed");
        assert_eq!(error_message(r#"{"message":"nope"}"#), "nope");
        assert_eq!(error_message("plain text"), "plain text");
    }
}
