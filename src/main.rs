//! cmdr - policy-gated shell execution for AI agents.
//!
//! **Default** (no subcommand): Serves MCP over stdio for hosts like Claude
//! Desktop. All tracing goes to stderr because stdout carries the protocol.
//!
//! **Server mode** (`cmdr serve`): Binds an HTTP server exposing the same
//! MCP tools over Streamable HTTP at `/mcp`, plus `/health` and `/sessions`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cmdr::{
    api::{self, AppState},
    commands::{CommandPolicy, FilePolicy, PolicyRules, PolicySource},
    config::Config,
    manager::TerminalManager,
    mcp::CmdrMcpServer,
    telemetry::Telemetry,
};

/// cmdr - run shell commands on behalf of AI agents
///
/// Commands are validated against an allow/deny policy, executed in
/// background sessions, and polled incrementally, so agents can launch
/// long-running work without holding a connection open.
#[derive(Parser, Debug)]
#[command(name = "cmdr", version, about, long_about = None)]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, env = "CMDR_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve MCP over Streamable HTTP instead of stdio
    Serve {
        /// Address to bind the HTTP server
        #[arg(long, env = "CMDR_BIND", default_value = "127.0.0.1:8080")]
        bind: SocketAddr,

        /// Allowed CORS origins (repeatable). No CORS headers when empty.
        #[arg(long = "cors-origin")]
        cors_origins: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Stdio mode speaks JSON-RPC on stdout, so tracing must use stderr there.
    if cli.command.is_none() {
        init_tracing_stderr();
    } else {
        init_tracing();
    }

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let loaded = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let have_config_file = loaded.is_some();
    let config = loaded.unwrap_or_default();
    if have_config_file {
        tracing::info!(path = %config_path.display(), "loaded config");
    } else {
        tracing::info!(path = %config_path.display(), "no config file, using defaults");
    }

    // A config file on disk backs a hot-reloading policy; otherwise the
    // rules are fixed for the lifetime of the process.
    let source = if have_config_file {
        PolicySource::File(FilePolicy::new(config_path.clone()))
    } else {
        PolicySource::Static(PolicyRules::from_config(&config.policy))
    };
    let policy = CommandPolicy::new(
        source,
        Duration::from_millis(config.policy.consult_timeout_ms),
    );

    let state = AppState {
        manager: Arc::new(TerminalManager::new(config.limits.clone())),
        policy,
        telemetry: Telemetry::new(&config.telemetry),
        config: Arc::new(config),
    };

    match cli.command {
        Some(Commands::Serve { bind, cors_origins }) => run_serve(state, bind, cors_origins).await,
        None => run_stdio(state).await,
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "cmdr=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn init_tracing_stderr() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "cmdr=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Serve MCP over stdio until the host closes the stream.
async fn run_stdio(state: AppState) -> anyhow::Result<()> {
    use rmcp::ServiceExt;

    tracing::info!("cmdr MCP stdio server starting");
    let service = CmdrMcpServer::new(state)
        .serve(rmcp::transport::stdio())
        .await
        .context("failed to start MCP stdio server")?;
    service.waiting().await.context("MCP stdio server failed")?;
    Ok(())
}

/// Serve MCP over Streamable HTTP, with Ctrl+C for graceful shutdown.
async fn run_serve(
    state: AppState,
    bind: SocketAddr,
    cors_origins: Vec<String>,
) -> anyhow::Result<()> {
    let app = api::router(state, api::RouterConfig { cors_origins });
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(addr = %bind, "HTTP server listening, MCP at /mcp");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("HTTP server failed")?;
    Ok(())
}
