use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use tether_server::handlers::{ConnectionInfoHandler, EchoHandler};
use tether_server::{CommandRouter, ServerConfig};

/// WebSocket command protocol server.
#[derive(Parser)]
#[command(name = "tether", version)]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 9090)]
    port: u16,

    /// Path of the WebSocket upgrade endpoint.
    #[arg(long, default_value = "/ws")]
    ws_path: String,

    /// Maximum per-send chunk size in bytes.
    #[arg(long, default_value_t = tether_server::server::DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    tracing::info!("Starting tether server");

    let mut router = CommandRouter::new();
    router.register("echo", Arc::new(EchoHandler));
    router.register("connection.info", Arc::new(ConnectionInfoHandler));
    let router = Arc::new(router);

    let shutdown = CancellationToken::new();
    let config = ServerConfig {
        port: args.port,
        ws_path: args.ws_path,
        buffer_size: args.buffer_size,
    };
    let handle = tether_server::start(config, router, shutdown.clone()).await?;
    tracing::info!(port = handle.port, "tether server ready");

    // Wait for shutdown signal, then unwind every connection loop
    // through its normal cleanup path.
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    shutdown.cancel();

    Ok(())
}
