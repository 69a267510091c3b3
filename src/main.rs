//! Multi-room WebSocket Chat Server - Entry Point
//!
//! Starts the TCP listener and shared registry, accepting connections.

use std::env;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use room_relay::{handle_connection, ChatRegistry, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=room_relay=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("room_relay=info")),
        )
        .init();

    let mut config = Config::from_env()?;

    // Bind address from command line wins over the environment
    if let Some(addr) = env::args().nth(1) {
        config.bind_addr = addr;
    }
    let config = Arc::new(config);

    // Start TCP listener
    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("WebSocket Chat Server listening on {}", config.bind_addr);

    let registry = Arc::new(ChatRegistry::default());

    // Connection accept loop
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("New connection from {}", addr);
                let registry = Arc::clone(&registry);
                let config = Arc::clone(&config);

                // Spawn handler task for each connection
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, registry, config).await {
                        error!("Connection handler error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
