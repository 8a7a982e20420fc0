//! streamd: a multi-address TCP/TLS stream server
//!
//! Features:
//! - Several virtual servers sharing listening sockets, selected by the
//!   local address each connection arrived on
//! - Optional TLS per listen address, with a bounded handshake
//! - Connection limiting and allow/deny access rules per server
//! - Configuration via CLI arguments or TOML file

mod config;
mod error;
mod runtime;

use config::Config;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let ports = config.build_ports()?;

    for port in &ports {
        for conf in port.confs() {
            info!(
                bind = %port.bind_addr(),
                addr = %conf.addr_text,
                server = %conf.server.name,
                ssl = conf.ssl,
                keepalive = port.so_keepalive(),
                "Listening"
            );
        }
    }

    info!(
        servers = config.servers.len(),
        workers = config.workers,
        max_connections = config.settings.max_connections,
        "Starting streamd"
    );

    runtime::run(
        ports.into_iter().map(Arc::new).collect(),
        config.workers,
        config.settings,
    )?;
    Ok(())
}
