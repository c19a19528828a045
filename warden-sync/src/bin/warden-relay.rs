//! Standalone relay.
//!
//! Usage: `warden-relay [BIND_ADDR]`. Falls back to `WARDEN_BIND`, then to
//! the default `127.0.0.1:9090`. Logging is controlled by `RUST_LOG`.

use log::info;
use warden_sync::{RelayServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut config = ServerConfig::default();
    if let Some(addr) = std::env::args().nth(1).or_else(|| std::env::var("WARDEN_BIND").ok()) {
        config.bind_addr = addr;
    }

    info!("Starting warden relay on {}", config.bind_addr);
    let server = RelayServer::new(config);
    server.run().await
}
