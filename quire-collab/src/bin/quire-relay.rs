//! Quire relay — standalone WebSocket relay for collaborative documents.
//!
//! ```text
//! quire-relay [BIND_ADDR]
//! ```
//!
//! Environment:
//! - `QUIRE_BIND`  bind address (default `127.0.0.1:9090`; the argument wins)
//! - `QUIRE_TOKEN` shared credential clients must present (optional)
//! - `RUST_LOG`    log filter for `env_logger`

use log::info;

use quire_collab::server::{ServerConfig, SyncServer};

fn config_from_env() -> ServerConfig {
    let mut config = ServerConfig::default();
    if let Ok(bind) = std::env::var("QUIRE_BIND") {
        config.bind_addr = bind;
    }
    if let Some(bind) = std::env::args().nth(1) {
        config.bind_addr = bind;
    }
    config.auth_token = std::env::var("QUIRE_TOKEN").ok().filter(|t| !t.is_empty());
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = config_from_env();
    info!(
        "Starting Quire relay on {} (auth {})",
        config.bind_addr,
        if config.auth_token.is_some() { "on" } else { "off" }
    );

    let handle = SyncServer::new(config).bind().await?;
    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");
    handle.shutdown().await;
    Ok(())
}
