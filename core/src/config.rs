//! Environment-only configuration. A YAML config file and a keep-alive
//! launcher are external collaborators and are not read by this crate.

use std::net::{Ipv4Addr, SocketAddr};

const PORT_VAR: &str = "BLENDER_MCP_PORT";
const START_NOW_VAR: &str = "BLENDER_MCP_START_NOW";
const LOG_LEVEL_VAR: &str = "BLENDER_MCP_LOG_LEVEL";

const DEFAULT_PORT: u16 = 6688;
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub bind_addr: SocketAddr,
    pub start_now: bool,
    pub log_level: String,
}

impl CoreConfig {
    pub fn from_env() -> Self {
        let port = std::env::var(PORT_VAR)
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);
        let start_now = std::env::var(START_NOW_VAR)
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let log_level = std::env::var(LOG_LEVEL_VAR).unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());

        CoreConfig {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            start_now,
            log_level,
        }
    }
}
