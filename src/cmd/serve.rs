//! HTTP API server command: `eventsense serve`.

use anyhow::Result;
use std::path::PathBuf;

use eventsense::attribution::server::{ServerConfig, start_server};
use eventsense::config::Config;

pub struct ServeArgs {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
    pub in_memory: bool,
}

/// Apply CLI overrides on top of the resolved configuration.
pub fn server_config(config: &Config, args: ServeArgs) -> ServerConfig {
    let mut server = ServerConfig::from(config);
    if let Some(host) = args.host {
        server.host = host;
    }
    if let Some(port) = args.port {
        server.port = port;
    }
    if let Some(db_path) = args.db_path {
        server.db_path = Some(db_path);
    }
    if args.in_memory {
        server.db_path = None;
    }
    server
}

pub async fn cmd_serve(config: &Config, args: ServeArgs) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
    start_server(server_config(config, args)).await
}
