//! tttd - Replicated tic-tac-toe server
//!
//! Serves one shared game to two players per topic. Several instances
//! pointed at the same Redis topic act as one game.
//!
//! # Usage
//!
//! ```bash
//! # WebSocket on :3000, replicating through redis://localhost:6379
//! tttd
//!
//! # Single process, no Redis
//! tttd --broker memory
//!
//! # Second instance on another port, newline-delimited JSON clients
//! tttd --port 3001 --use-lines
//! ```

use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tttd::config::{BrokerConfig, CliOverrides, Config};
use tttd::game::{spawn_game, GameHandle};
use tttd::replication::{Broker, InMemoryBroker, RedisBroker, ReplicationChannel};
use tttd::server::{
    GameServer, JsonLinesTransport, ServerInfo, Transport, TransportKind, WebSocketTransport,
};

/// Replicated tic-tac-toe server
#[derive(Parser, Debug)]
#[command(name = "tttd", version, about)]
struct Args {
    #[command(flatten)]
    overrides: CliOverrides,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // A missing .env is normal.
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tttd=info".parse()?)
                .add_directive("ttt_core=info".parse()?)
                .add_directive("ttt_protocol=info".parse()?),
        )
        .init();

    if let Ok(path) = dotenv {
        info!(path = %path.display(), "Loaded environment file");
    }

    let config = Config::from_env()
        .and_then(|config| config.with_overrides(&args.overrides))
        .context("Invalid configuration")?;
    let instance_id = config.instance_id();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        instance = %instance_id,
        transport = %config.transport,
        broker = %config.broker,
        topic = %config.topic,
        "tttd starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let broker = build_broker(&config.broker)?;
    let (game, outbox) = spawn_game(instance_id.clone());
    info!("Game actor started");

    let channel = ReplicationChannel::new(broker, config.topic.clone());
    let (publisher, subscriber) = channel.spawn(game.clone(), outbox, cancel_token.clone());

    let info = ServerInfo::new(&instance_id);
    let addr = config.bind_addr();
    let result = match config.transport {
        TransportKind::WebSocket => {
            serve(&addr, WebSocketTransport, game, info, cancel_token.clone()).await
        }
        TransportKind::JsonLines => {
            serve(&addr, JsonLinesTransport, game, info, cancel_token.clone()).await
        }
    };

    // Stop replication whether the server exited cleanly or not.
    cancel_token.cancel();
    for task in [publisher, subscriber] {
        if let Err(e) = task.await {
            warn!(error = %e, "Replication task ended abnormally");
        }
    }

    result?;
    info!("tttd stopped");
    Ok(())
}

fn build_broker(config: &BrokerConfig) -> Result<Arc<dyn Broker>> {
    match config {
        BrokerConfig::Memory => {
            warn!("Using in-memory broker; this instance will not replicate");
            Ok(Arc::new(InMemoryBroker::new()))
        }
        BrokerConfig::Redis(url) => {
            let broker = RedisBroker::new(url).context("Failed to create redis broker")?;
            Ok(Arc::new(broker))
        }
    }
}

async fn serve<T: Transport>(
    addr: &str,
    transport: T,
    game: GameHandle,
    info: ServerInfo,
    cancel_token: CancellationToken,
) -> Result<()> {
    let server = GameServer::bind(addr, transport, game, info, cancel_token)
        .await
        .context("Failed to start server")?;

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
