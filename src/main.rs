//! agent-server - runs agent sessions behind an exclusive-mode gate.
//!
//! Usage:
//!   agent-server serve [--port 8888] [--exclusive]      # Start HTTP server
//!   agent-server sandbox <create|delete|refresh|...>    # Operate on sandbox instances

use agent_server::agent::HttpAgent;
use agent_server::sandbox_client::CreateOptions;
use agent_server::{AppState, SandboxConfig, SandboxManager, ServerConfig};
use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "agent-server")]
#[command(about = "Agent run server with remote sandbox support")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging, including every status broadcast
    #[arg(long, global = true, env = "AGENT_SERVER_DEBUG")]
    debug: bool,
}

#[derive(ClapArgs, Debug, Clone)]
struct SandboxArgs {
    /// Sandbox host base URL
    #[arg(long = "sandbox-url", env = "SANDBOX_BASE_URL")]
    url: Option<String>,

    /// Token sent as x-jwt-token
    #[arg(long = "sandbox-token", env = "SANDBOX_JWT_TOKEN", default_value = "")]
    token: String,

    /// Default lease for new instances, in minutes
    #[arg(long = "sandbox-ttl-minutes", default_value = "1440")]
    ttl_minutes: u32,
}

impl SandboxArgs {
    fn config(&self) -> Option<SandboxConfig> {
        let url = self.url.as_ref()?;
        let mut config = SandboxConfig::new(url, &self.token);
        config.default_ttl_minutes = self.ttl_minutes;
        Some(config)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8888", env = "AGENT_SERVER_PORT")]
        port: u16,

        /// Allow only one running session at a time
        #[arg(long, env = "AGENT_SERVER_EXCLUSIVE")]
        exclusive: bool,

        /// Agent worker endpoint that executes queries
        #[arg(long, env = "AGENT_WORKER_URL", default_value = "http://127.0.0.1:8890/run")]
        agent_url: String,

        #[command(flatten)]
        sandbox: SandboxArgs,
    },
    /// Operate on remote sandbox instances directly
    Sandbox {
        #[command(flatten)]
        sandbox: SandboxArgs,

        #[command(subcommand)]
        action: SandboxAction,
    },
}

#[derive(Subcommand, Debug)]
enum SandboxAction {
    /// Provision a new instance
    Create {
        #[arg(long)]
        ttl_minutes: Option<u32>,
    },
    /// Delete an instance
    Delete { id: String },
    /// Extend an instance lease
    Refresh {
        id: String,
        #[arg(long)]
        ttl_minutes: u32,
    },
    /// Print the image version of an instance
    Version { id: String },
    /// Check whether an instance answers
    Ping { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match args.command {
        Commands::Serve {
            port,
            exclusive,
            agent_url,
            sandbox,
        } => {
            let config = ServerConfig {
                port,
                exclusive,
                debug: args.debug,
            };
            let mut state = AppState::new(&config, Arc::new(HttpAgent::new(agent_url)));
            if let Some(sandbox) = sandbox.config() {
                let manager = SandboxManager::new(&sandbox).context("invalid sandbox configuration")?;
                state = state.with_sandbox(Arc::new(manager));
            }
            agent_server::run_server(config.port, state)
                .await
                .context("HTTP server failed")?;
        }
        Commands::Sandbox { sandbox, action } => {
            let config = sandbox.config().context("--sandbox-url is required")?;
            let manager = SandboxManager::new(&config)?;
            run_sandbox_action(&manager, action).await?;
        }
    }
    Ok(())
}

async fn run_sandbox_action(manager: &SandboxManager, action: SandboxAction) -> anyhow::Result<()> {
    match action {
        SandboxAction::Create { ttl_minutes } => {
            let instance = manager
                .create_instance(CreateOptions {
                    ttl_minutes,
                    ..CreateOptions::default()
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&instance)?);
        }
        SandboxAction::Delete { id } => {
            let outcome = manager.delete_instance(&id).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        SandboxAction::Refresh { id, ttl_minutes } => {
            manager.refresh_instance_ttl(&id, ttl_minutes).await?;
            println!("refreshed {} for {} minutes", id, ttl_minutes);
        }
        SandboxAction::Version { id } => {
            println!("{}", manager.get_image_version(&id).await);
        }
        SandboxAction::Ping { id } => {
            let alive = manager.test_instance(&id).await;
            println!("{}", if alive { "alive" } else { "unreachable" });
            if !alive {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}
