//! Agent run server: exclusive-mode admission, live status over WebSocket
//! and lifecycle management of remote sandbox instances.

pub mod admission;
pub mod agent;
pub mod config;
pub mod error;
pub mod gate;
pub mod http_server;
pub mod runner;
pub mod sandbox;
pub mod sandbox_client;
pub mod state;
pub mod status;

pub use config::{SandboxConfig, ServerConfig};
pub use error::{AgentError, ApiError, SandboxError};
pub use gate::ExclusivityGate;
pub use http_server::{build_router, run_server};
pub use sandbox::{DeleteOutcome, SandboxInstance, SandboxManager, SandboxState};
pub use state::{AppState, SessionRegistry};
pub use status::StatusBroadcaster;
