use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent_fleet_error::FleetError;
use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use utoipa::OpenApi;

use crate::agent::{AgentRuntime, MockRuntime, ProcessRuntime};
use crate::config::{
    default_state_path, FleetConfig, DEFAULT_AGENT_BIN, DEFAULT_CLEANUP_INTERVAL_SECS,
    DEFAULT_MAX_INSTANCES, DEFAULT_MAX_SESSION_AGE_DAYS, DEFAULT_QUERY_TIMEOUT_MS,
};
use crate::reaper::Reaper;
use crate::router::{build_router_with_state, shutdown_instances, ApiDoc, AppState};
use crate::store::{MemoryStore, Store};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8000;

#[derive(Parser, Debug)]
#[command(name = "agent-fleet", bin_name = "agent-fleet")]
#[command(about = "Runs and supervises a fleet of coding-agent instances", version)]
#[command(arg_required_else_help = true)]
pub struct AgentFleetCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP and WebSocket server.
    Server(ServerArgs),
    /// Print the OpenAPI document.
    Openapi(OpenapiArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', env = "AGENT_FLEET_HOST", default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', env = "AGENT_FLEET_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long, env = "AGENT_FLEET_MAX_INSTANCES", default_value_t = DEFAULT_MAX_INSTANCES)]
    max_instances: usize,

    /// Parent directory for instances that do not set a working directory.
    #[arg(long, env = "AGENT_FLEET_WORKDIR_ROOT", default_value = "workspaces")]
    workdir_root: PathBuf,

    #[arg(long, env = "AGENT_FLEET_QUERY_TIMEOUT_MS", default_value_t = DEFAULT_QUERY_TIMEOUT_MS)]
    query_timeout_ms: u64,

    #[arg(
        long,
        env = "AGENT_FLEET_CLEANUP_INTERVAL_SECS",
        default_value_t = DEFAULT_CLEANUP_INTERVAL_SECS
    )]
    cleanup_interval_secs: u64,

    #[arg(
        long,
        env = "AGENT_FLEET_MAX_SESSION_AGE_DAYS",
        default_value_t = DEFAULT_MAX_SESSION_AGE_DAYS
    )]
    max_session_age_days: i64,

    #[arg(long, env = "AGENT_FLEET_AGENT_BIN", default_value = DEFAULT_AGENT_BIN)]
    agent_bin: PathBuf,

    /// JSON snapshot file. Defaults to the user data directory.
    #[arg(long, env = "AGENT_FLEET_STATE_FILE", conflicts_with = "ephemeral")]
    state_file: Option<PathBuf>,

    /// Keep all state in memory only.
    #[arg(long, env = "AGENT_FLEET_EPHEMERAL")]
    ephemeral: bool,

    /// Answer queries with a built-in echo agent instead of spawning one.
    #[arg(long, env = "AGENT_FLEET_MOCK_AGENT")]
    mock_agent: bool,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,
}

impl ServerArgs {
    fn fleet_config(&self) -> FleetConfig {
        FleetConfig {
            max_instances: self.max_instances,
            workdir_root: self.workdir_root.clone(),
            query_timeout: Duration::from_millis(self.query_timeout_ms),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            max_session_age_days: self.max_session_age_days,
            agent_bin: self.agent_bin.clone(),
        }
    }
}

#[derive(Args, Debug)]
pub struct OpenapiArgs {
    /// Write to this file instead of stdout.
    #[arg(long, short = 'o')]
    out: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Fleet(#[from] FleetError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_agent_fleet() -> Result<(), CliError> {
    let cli = AgentFleetCli::parse();
    init_logging()?;
    run_command(&cli.command)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(args),
        Command::Openapi(args) => write_openapi(args),
    }
}

fn run_server(server: &ServerArgs) -> Result<(), CliError> {
    let config = server.fleet_config();
    let store: Arc<dyn Store> = if server.ephemeral {
        Arc::new(MemoryStore::new())
    } else {
        let path = server.state_file.clone().unwrap_or_else(default_state_path);
        tracing::info!(path = %path.display(), "loading state");
        Arc::new(MemoryStore::open(path)?)
    };
    let runtime: Arc<dyn AgentRuntime> = if server.mock_agent {
        tracing::warn!("using the built-in mock agent");
        Arc::new(MockRuntime::echo())
    } else {
        Arc::new(ProcessRuntime::new(config.agent_bin.clone()))
    };

    let state = Arc::new(AppState::new(config, store.clone(), runtime));
    let (mut router, state) = build_router_with_state(state);

    let cors = build_cors_layer(server)?;
    router = router.layer(cors);

    let addr = format!("{}:{}", server.host, server.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        state.registry().reconcile_stale().await?;

        let shutdown = CancellationToken::new();
        let reaper = Reaper::new(state.registry().clone(), store).spawn(shutdown.clone());

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "server listening");
        let shutdown_state = state.clone();
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
                shutdown.cancel();
                shutdown_instances(&shutdown_state).await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()));

        if let Err(err) = reaper.await {
            tracing::warn!(error = %err, "reaper task ended abnormally");
        }
        served
    })
}

fn write_openapi(args: &OpenapiArgs) -> Result<(), CliError> {
    let json = serde_json::to_string_pretty(&ApiDoc::openapi())?;
    match &args.out {
        Some(path) => std::fs::write(path, json)?,
        None => println!("{json}"),
    }
    Ok(())
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    let mut origins = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        // No origin is allowed unless one is configured.
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }

    if server.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &server.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if server.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &server.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    if server.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(cors)
}
