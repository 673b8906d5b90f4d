//! Quire relay: the WebSocket hub that collaborative sessions connect to.
//!
//! Configured from the environment (`QUIRE_BIND_ADDR`,
//! `QUIRE_BROADCAST_CAPACITY`, `QUIRE_SHARE_TOKENS`); log output follows
//! `RUST_LOG`.

use quire_collab::server::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(2);
        }
    };
    log::info!(
        "Starting relay on {} ({} share tokens)",
        config.bind_addr,
        config.share_tokens.len()
    );

    let server = RelayServer::new(config);
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                log::error!("Relay stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down, {} rooms open", server.room_count().await);
        }
    }
}
