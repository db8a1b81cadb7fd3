//! Standalone bus server daemon.
//!
//! Runs the TradePulse message bus with either the default listen address or
//! a TOML config file passed as the first argument:
//!
//! ```bash
//! cargo run --release --bin bus_server -- config/bus.toml
//! ```

use anyhow::Result;
use tradepulse_bus::{BusServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };

    let server = BusServer::bind(config).await?;
    server.run_forever().await?;
    Ok(())
}
