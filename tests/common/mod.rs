#![allow(dead_code)]

use agent_server::agent::{Agent, AgentContext, AgentEvent};
use agent_server::sandbox_client::{SandboxClient, StaticToken};
use agent_server::{AgentError, AppState, SandboxManager, ServerConfig};
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, Response};
use axum::Router;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

pub const BASE_DOMAIN: &str = "sandbox.test";

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    /// Host without the port, e.g. `inst-1.sandbox.test`.
    pub host: String,
    pub path: String,
    pub headers: HeaderMap,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[derive(Debug, Clone)]
pub struct FakeReply {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
    pub body: String,
    pub delay: Option<Duration>,
}

impl FakeReply {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: String::new(),
            delay: None,
        }
    }

    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            body: body.to_string(),
            headers: vec![("content-type", "application/json".to_string())],
            ..Self::status(status)
        }
    }

    pub fn header(mut self, name: &'static str, value: &str) -> Self {
        self.headers.push((name, value.to_string()));
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

type Responder = Arc<dyn Fn(&Recorded) -> FakeReply + Send + Sync>;

#[derive(Clone)]
struct FakeState {
    requests: Arc<Mutex<Vec<Recorded>>>,
    responder: Responder,
}

/// A local stand-in for the remote sandbox host. Every instance subdomain is
/// resolved to the same listener.
pub struct FakeSandboxHost {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl FakeSandboxHost {
    pub async fn start<F>(responder: F) -> Self
    where
        F: Fn(&Recorded) -> FakeReply + Send + Sync + 'static,
    {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = FakeState {
            requests: requests.clone(),
            responder: Arc::new(responder),
        };
        let app = Router::new().fallback(handle).with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, requests }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", BASE_DOMAIN, self.addr.port())
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    /// HTTP client resolving the base domain and the given instance hosts to
    /// this listener.
    pub fn http_client(&self, instances: &[&str], timeout: Duration) -> reqwest::Client {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .resolve(BASE_DOMAIN, self.addr);
        for id in instances {
            builder = builder.resolve(&format!("{}.{}", id, BASE_DOMAIN), self.addr);
        }
        builder.build().unwrap()
    }

    pub fn client(&self, instances: &[&str]) -> SandboxClient {
        self.client_with_timeout(instances, Duration::from_secs(5))
    }

    pub fn client_with_timeout(&self, instances: &[&str], timeout: Duration) -> SandboxClient {
        SandboxClient::with_http_client(
            self.http_client(instances, timeout),
            &self.base_url(),
            Arc::new(StaticToken("test-token".into())),
        )
        .unwrap()
    }

    pub fn manager(&self, instances: &[&str]) -> SandboxManager {
        SandboxManager::with_client(self.client(instances), 1440)
    }
}

async fn handle(State(state): State<FakeState>, req: Request) -> Response<Body> {
    let host = req
        .headers()
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let host = host.split(':').next().unwrap_or_default().to_string();
    let recorded = Recorded {
        method: req.method().clone(),
        host,
        path: req.uri().path().to_string(),
        headers: req.headers().clone(),
    };
    state.requests.lock().unwrap().push(recorded.clone());

    let reply = (state.responder)(&recorded);
    if let Some(delay) = reply.delay {
        tokio::time::sleep(delay).await;
    }
    let mut builder = Response::builder().status(reply.status);
    for (name, value) in &reply.headers {
        builder = builder.header(*name, value);
    }
    builder.body(Body::from(reply.body)).unwrap()
}

/// Agent that answers immediately with a fixed result.
pub struct EchoAgent;

#[async_trait]
impl Agent for EchoAgent {
    async fn run(&self, ctx: AgentContext, query: String) -> Result<String, AgentError> {
        ctx.emit(AgentEvent::Progress {
            message: format!("echoing {}", query),
        });
        Ok(format!("echo: {}", query))
    }
}

/// Agent that blocks until released, reporting each session it starts.
pub struct BlockingAgent {
    pub started: mpsc::UnboundedSender<String>,
    pub release: Arc<Notify>,
}

impl BlockingAgent {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>, Arc<Notify>) {
        let (started, rx) = mpsc::unbounded_channel();
        let release = Arc::new(Notify::new());
        (
            Self {
                started,
                release: release.clone(),
            },
            rx,
            release,
        )
    }
}

#[async_trait]
impl Agent for BlockingAgent {
    async fn run(&self, ctx: AgentContext, _query: String) -> Result<String, AgentError> {
        let _ = self.started.send(ctx.session_id.clone());
        self.release.notified().await;
        Ok("released".to_string())
    }
}

pub fn app_state(exclusive: bool, agent: Arc<dyn Agent>) -> AppState {
    let config = ServerConfig {
        exclusive,
        ..ServerConfig::default()
    };
    AppState::new(&config, agent)
}

pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

pub fn post_json(uri: &str, body: serde_json::Value) -> axum::http::Request<Body> {
    axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get(uri: &str) -> axum::http::Request<Body> {
    axum::http::Request::builder()
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}
