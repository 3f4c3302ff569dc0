//! lanbridge CLI - expose a LAN service through a public broker
//!
//! `lanbridge broker` runs on the public host, `lanbridge agent` inside the LAN.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lanbridge_agent::{AgentConfig, AgentPool, MIN_WORKERS};
use lanbridge_broker::{Broker, BrokerConfig};
use lanbridge_transport_websocket::WebSocketConnector;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LONG_VERSION: &str = concat!(
    env!("GIT_TAG"),
    " (commit ",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// lanbridge - reach a LAN service through a public broker
#[derive(Parser, Debug)]
#[command(name = "lanbridge")]
#[command(version, long_version = LONG_VERSION)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, env = "LANBRIDGE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept public TCP clients and hand them to connected agents
    #[command(long_about = r#"
Run the public broker. External TCP clients connect to the public listener;
agents inside the LAN connect to the tunnel listener over WebSocket.

EXAMPLES:
  # Expose whatever the agents forward to on port 2222
  lanbridge broker --listen 0.0.0.0:2222 --tunnel-listen 0.0.0.0:8081 \
    --secret admin:changeme

ENVIRONMENT VARIABLES:
  LANBRIDGE_LISTEN         Public listener address
  LANBRIDGE_TUNNEL_LISTEN  Tunnel and admin listener address
  LANBRIDGE_SECRET         Shared secret (username:password)
    "#)]
    Broker {
        /// Public listener for external clients
        #[arg(long, env = "LANBRIDGE_LISTEN", default_value = "0.0.0.0:8080")]
        listen: SocketAddr,

        /// Listener for agent tunnels and the admin page
        #[arg(long, env = "LANBRIDGE_TUNNEL_LISTEN", default_value = "0.0.0.0:8081")]
        tunnel_listen: SocketAddr,

        /// Shared secret agents and admins authenticate with (username:password)
        #[arg(long, env = "LANBRIDGE_SECRET")]
        secret: Option<String>,
    },

    /// Keep tunnels open to a broker and forward flows to a local target
    #[command(long_about = r#"
Run the LAN agent. Each worker keeps one tunnel open to the broker and
forwards one flow at a time to the local target.

EXAMPLES:
  # Forward broker clients to the local SSH server
  lanbridge agent --broker broker.example.com:8081 --target 127.0.0.1:22 \
    --secret admin:changeme

ENVIRONMENT VARIABLES:
  LANBRIDGE_BROKER   Broker tunnel address (host:port or ws:// / wss:// URL)
  LANBRIDGE_TARGET   Local target address
  LANBRIDGE_WORKERS  Number of parallel tunnels
  LANBRIDGE_SECRET   Shared secret (username:password)
    "#)]
    Agent {
        /// Broker tunnel address
        #[arg(long, env = "LANBRIDGE_BROKER", default_value = "114.114.114.114:8081")]
        broker: String,

        /// Local target (host:port) dialed for every flow
        #[arg(long, env = "LANBRIDGE_TARGET", default_value = "127.0.0.1:8000")]
        target: String,

        /// Parallel tunnels; values below the minimum are raised to it
        #[arg(long, env = "LANBRIDGE_WORKERS", default_value_t = MIN_WORKERS)]
        workers: usize,

        /// Shared secret (username:password)
        #[arg(long, env = "LANBRIDGE_SECRET")]
        secret: Option<String>,

        /// Seconds to wait before a worker reconnects
        #[arg(long, default_value = "10")]
        reconnect_delay: u64,

        /// Seconds allowed for dialing the local target
        #[arg(long, default_value = "10")]
        dial_timeout: u64,
    },
}

fn setup_logging(log_level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("Invalid log level: {}", log_level))?,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Validate address format (host:port)
fn validate_address(addr: &str, addr_type: &str) -> Result<()> {
    if addr.starts_with("ws://") || addr.starts_with("wss://") {
        return Ok(());
    }

    let Some((host, port)) = addr.rsplit_once(':') else {
        anyhow::bail!(
            "Invalid {} address format: '{}' (expected format: host:port)",
            addr_type,
            addr
        );
    };

    if host.is_empty() {
        anyhow::bail!(
            "Invalid {} address format: '{}' (host cannot be empty)",
            addr_type,
            addr
        );
    }

    port.parse::<u16>().with_context(|| {
        format!(
            "Invalid {} address format: '{}' (port must be a number between 0 and 65535)",
            addr_type, addr
        )
    })?;

    Ok(())
}

/// Workers below the minimum are raised to it
fn effective_workers(requested: usize) -> usize {
    if requested < MIN_WORKERS {
        warn!(
            "Requested {} workers, using the minimum of {}",
            requested, MIN_WORKERS
        );
        MIN_WORKERS
    } else {
        requested
    }
}

async fn run_broker(
    listen: SocketAddr,
    tunnel_listen: SocketAddr,
    secret: Option<String>,
) -> Result<()> {
    let config = BrokerConfig::default()
        .with_public_addr(listen)
        .with_tunnel_addr(tunnel_listen)
        .with_secret(secret.as_deref());

    info!("Public listener: {}", listen);
    info!("Tunnel listener: {}", tunnel_listen);
    if config.websocket.auth.is_none() {
        warn!("No secret configured, any agent may connect");
    }

    let broker = Broker::new(config);

    tokio::select! {
        result = broker.run() => {
            result.context("Broker stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    Ok(())
}

async fn run_agent(config: AgentConfig) -> Result<()> {
    let connector = WebSocketConnector::new(&config.broker, Arc::new(config.websocket.clone()))
        .with_context(|| format!("Invalid broker address: {}", config.broker))?;
    let pool = Arc::new(AgentPool::new(config, Arc::new(connector)).context("Failed to create agent")?);

    info!("Broker: {}", pool.config().broker);
    info!("Target: {}", pool.target().get());
    info!("Workers: {}", pool.config().workers);

    let mut agent_task = tokio::spawn(pool.clone().run());
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            pool.stop();
            if let Err(e) = (&mut agent_task).await {
                error!("Agent task panicked: {}", e);
            }
        }
        result = &mut agent_task => {
            if let Err(e) = result {
                error!("Agent task panicked: {}", e);
                return Err(e.into());
            }
        }
    }

    info!("Agent stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level)?;

    match cli.command {
        Commands::Broker {
            listen,
            tunnel_listen,
            secret,
        } => run_broker(listen, tunnel_listen, secret).await,
        Commands::Agent {
            broker,
            target,
            workers,
            secret,
            reconnect_delay,
            dial_timeout,
        } => {
            validate_address(&broker, "broker")?;
            validate_address(&target, "target")?;

            let config = AgentConfig::new(broker, target)
                .with_workers(effective_workers(workers))
                .with_secret(secret.as_deref())
                .with_reconnect_delay(Duration::from_secs(reconnect_delay))
                .with_dial_timeout(Duration::from_secs(dial_timeout));

            run_agent(config).await
        }
    }
}
