use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relay_broker::Broker;
use relay_push::{ClaudeCodeAdapter, OpencodeAdapter, PushRegistry, SessionResolver};
use relay_tools::ToolSurface;
use relay_transport::NatsTransport;
use tokio::time::MissedTickBehavior;
use tracing::info;

mod config;
mod http;
mod rpc;
mod stdio;

use config::{Config, TransportMode};

#[derive(Debug, Parser)]
#[command(name = "relay-mesh")]
#[command(about = "Local message broker for coding agents")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the broker (default when no subcommand is given).
    Serve,
    /// Print version information.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Stdout may carry the protocol, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Version => {
            println!("relay-mesh {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Serve => serve().await,
    }
}

async fn serve() -> Result<()> {
    let config = Config::from_env()?;

    let transport = NatsTransport::connect(&config.nats_url)
        .await
        .with_context(|| format!("connect to transport at {}", config.nats_url))?;
    let broker = Broker::start(Arc::new(transport))
        .await
        .context("ensure relay stream")?;

    let mut push = PushRegistry::new();
    push.register(Arc::new(OpencodeAdapter::new(
        &config.opencode_url,
        config.push_timeout,
        config.no_reply,
    )));
    push.register(Arc::new(ClaudeCodeAdapter::new(
        config.state_dir.join("claude-code"),
    )));

    let resolver = (!config.opencode_url.is_empty()).then(|| {
        Arc::new(SessionResolver::new(
            &config.opencode_url,
            config.push_timeout,
            config.auto_bind_window,
        ))
    });

    let surface = Arc::new(ToolSurface::new(broker.clone(), Arc::new(push), resolver));

    if let Some(max_age) = config.prune_max_age {
        spawn_prune_sweep(broker.clone(), max_age);
    }

    match config.transport {
        TransportMode::Stdio => stdio::serve(surface).await,
        TransportMode::Http => http::serve(surface, config.http_addr, &config.http_path).await,
    }
}

fn spawn_prune_sweep(broker: Broker, max_age: Duration) {
    let period = (max_age / 2).max(Duration::from_secs(30));
    info!(?max_age, ?period, "stale-agent sweep enabled");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let removed = broker.prune_stale(max_age);
            if !removed.is_empty() {
                info!(count = removed.len(), "pruned stale agents");
            }
        }
    });
}
