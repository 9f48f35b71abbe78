//! burrow command-line entry point
//!
//! `burrow serve` runs a bridge from a YAML configuration file;
//! `burrow agent` runs an agent that dials out to a bridge.

use anyhow::{Context, Result};
use burrow_agent::{AgentConfig, AgentSession};
use burrow_proto::PipelineMode;
use burrow_registry::{AgentRegistry, JsonFileStore, RegistryStore, TunnelRegistry};
use burrow_server::{
    BridgeServer, ConnectionManager, DispatcherSupervisor, HealthSupervisor, ServerConfig,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

#[derive(Parser)]
#[command(name = "burrow", version = VERSION, about = "Reverse tunnel bridge and agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the bridge server
    Serve {
        /// Path to the YAML configuration file
        #[arg(short, long, env = "BURROW_CONFIG")]
        config: PathBuf,
    },
    /// Run an agent that dials out to a bridge
    Agent {
        /// Bridge address, "host:port"
        #[arg(short, long, env = "BURROW_SERVER")]
        server: String,
        /// Verification secret known to the bridge
        #[arg(long, env = "BURROW_SECRET", hide_env_values = true)]
        secret: String,
        /// Compression/encryption applied after the handshake
        #[arg(long, value_enum, default_value_t = PipelineArg::None)]
        pipeline: PipelineArg,
        /// HTTP CONNECT proxy to dial the bridge through
        #[arg(long, env = "BURROW_PROXY")]
        proxy_url: Option<String>,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PipelineArg {
    None,
    Compress,
    Encrypt,
    Both,
}

impl From<PipelineArg> for PipelineMode {
    fn from(arg: PipelineArg) -> Self {
        match arg {
            PipelineArg::None => PipelineMode::None,
            PipelineArg::Compress => PipelineMode::Compress,
            PipelineArg::Encrypt => PipelineMode::Encrypt,
            PipelineArg::Both => PipelineMode::Both,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => serve(config).await,
        Command::Agent {
            server,
            secret,
            pipeline,
            proxy_url,
        } => agent(server, secret, pipeline.into(), proxy_url).await,
    }
}

async fn serve(path: PathBuf) -> Result<()> {
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: ServerConfig =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    config.validate().context("invalid configuration")?;

    info!(version = VERSION, "starting bridge");

    let mut agents = AgentRegistry::new();
    if let Some(max) = config.max_agents {
        agents = agents.with_max_connected(max);
    }
    agents.seed(config.agents.clone());
    let agents = Arc::new(agents);

    let tunnels = Arc::new(TunnelRegistry::new());
    for tunnel in &config.tunnels {
        tunnels
            .add(tunnel.clone())
            .with_context(|| format!("tunnel {}", tunnel.id))?;
    }

    let store = match &config.state_dir {
        Some(dir) => {
            let store = JsonFileStore::new(dir);
            restore_state(&store, &agents, &tunnels).await;
            Some(Arc::new(store))
        }
        None => None,
    };

    let manager = Arc::new(ConnectionManager::new());
    let shutdown = CancellationToken::new();

    let supervisor = DispatcherSupervisor::new(config.clone(), tunnels.clone(), manager.clone());
    supervisor.start();

    let health = HealthSupervisor::new(agents.clone(), manager.clone(), config.timeouts.disconnect());
    tokio::spawn(health.run(shutdown.child_token()));

    if let Some(store) = store {
        tokio::spawn(persist_on_change(
            store,
            agents.clone(),
            tunnels.clone(),
            shutdown.child_token(),
        ));
    }

    let bridge = BridgeServer::new(config, agents, manager);
    tokio::select! {
        result = bridge.run() => {
            result.context("bridge server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    shutdown.cancel();
    supervisor.shutdown();
    Ok(())
}

/// Merge persisted state in under what the config file declares
async fn restore_state(store: &JsonFileStore, agents: &AgentRegistry, tunnels: &TunnelRegistry) {
    match store.load_agents().await {
        Ok(persisted) => {
            let unknown: Vec<_> = persisted
                .into_iter()
                .filter(|spec| agents.lookup(&spec.id).is_err())
                .collect();
            agents.seed(unknown);
        }
        Err(e) => warn!("could not load persisted agents: {}", e),
    }

    match store.load_tunnels().await {
        Ok(persisted) => {
            for tunnel in persisted {
                if tunnels.get(&tunnel.id).is_ok() {
                    continue;
                }
                let id = tunnel.id.clone();
                if let Err(e) = tunnels.add(tunnel) {
                    warn!(tunnel = %id, "skipping persisted tunnel: {}", e);
                }
            }
        }
        Err(e) => warn!("could not load persisted tunnels: {}", e),
    }
}

/// Write registry state back out whenever the tunnel table changes
async fn persist_on_change(
    store: Arc<JsonFileStore>,
    agents: Arc<AgentRegistry>,
    tunnels: Arc<TunnelRegistry>,
    cancel: CancellationToken,
) {
    let mut events = tunnels.subscribe();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => {
                if let Err(tokio::sync::broadcast::error::RecvError::Closed) = event {
                    return;
                }
            }
        }
        if let Err(e) = store.save_tunnels(&tunnels.all()).await {
            error!("failed to persist tunnels: {}", e);
        }
        if let Err(e) = store.save_agents(&agents.specs()).await {
            error!("failed to persist agents: {}", e);
        }
    }
}

async fn agent(
    server: String,
    secret: String,
    pipeline: PipelineMode,
    proxy_url: Option<String>,
) -> Result<()> {
    info!(version = VERSION, %server, "starting agent");

    let mut config = AgentConfig::new(server, secret);
    config.pipeline = pipeline;
    config.proxy_url = proxy_url;

    let handle = AgentSession::start(config).context("starting agent session")?;

    tokio::select! {
        _ = handle.done() => {
            if handle.status() == burrow_agent::AgentStatus::Error {
                anyhow::bail!("agent stopped on an unrecoverable error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            handle.stop().await;
        }
    }
    Ok(())
}
