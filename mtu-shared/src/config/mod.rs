//! Configuration and logging bootstrap shared by the hub and its clients.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MtuError, MtuResult};

/// Default bind address for the command (request/reply) server.
pub const DEFAULT_CMD_SERVER_IP: &str = "0.0.0.0";
/// Default bind port for the command (request/reply) server.
pub const DEFAULT_CMD_SERVER_PORT: u16 = 5200;
/// Default bind address for the publish (broadcast) server.
pub const DEFAULT_PUB_SERVER_IP: &str = "0.0.0.0";
/// Default bind port for the publish (broadcast) server.
pub const DEFAULT_PUB_SERVER_PORT: u16 = 5210;
/// Default number of send attempts before a command is reported as failed.
pub const DEFAULT_MAX_TRIES: u32 = 3;
/// Default aggregation window for batching periodic updates.
pub const DEFAULT_AGGREGATION_WINDOW: Duration = Duration::from_millis(20);
/// Default number of workers executing command-server requests concurrently.
pub const DEFAULT_COMMAND_WORKER_POOL_SIZE: usize = 6;
/// Default per-request reply time budget on the command server.
pub const DEFAULT_COMMAND_REPLY_TIMEOUT_MS: u64 = 10_000;
/// Default number of TCP bind retries before a server gives up and exits.
pub const DEFAULT_BIND_MAX_ATTEMPTS: u32 = 5;

/// Hub-side configuration: where it listens and how it batches traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub command_server_ip: String,
    pub command_server_port: u16,
    pub publish_server_ip: String,
    pub publish_server_port: u16,
    pub aggregation_window_ms: u64,
    pub max_send_tries: u32,
    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_recovery_seconds: u64,
    pub command_worker_pool_size: usize,
    pub command_reply_timeout_ms: u64,
    pub bind_max_attempts: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_server_ip: DEFAULT_CMD_SERVER_IP.to_string(),
            command_server_port: DEFAULT_CMD_SERVER_PORT,
            publish_server_ip: DEFAULT_PUB_SERVER_IP.to_string(),
            publish_server_port: DEFAULT_PUB_SERVER_PORT,
            aggregation_window_ms: DEFAULT_AGGREGATION_WINDOW.as_millis() as u64,
            max_send_tries: DEFAULT_MAX_TRIES,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_recovery_seconds: 30,
            command_worker_pool_size: DEFAULT_COMMAND_WORKER_POOL_SIZE,
            command_reply_timeout_ms: DEFAULT_COMMAND_REPLY_TIMEOUT_MS,
            bind_max_attempts: DEFAULT_BIND_MAX_ATTEMPTS,
        }
    }
}

impl HubConfig {
    #[must_use]
    pub fn aggregation_window(&self) -> Duration {
        Duration::from_millis(self.aggregation_window_ms)
    }

    #[must_use]
    pub fn command_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.command_reply_timeout_ms)
    }

    #[must_use]
    pub fn command_server_addr(&self) -> String {
        format!("{}:{}", self.command_server_ip, self.command_server_port)
    }

    #[must_use]
    pub fn publish_server_addr(&self) -> String {
        format!("{}:{}", self.publish_server_ip, self.publish_server_port)
    }

    /// Loads configuration layering, in increasing priority: built-in
    /// defaults, an optional `mtu-hub.toml` / `mtu-hub.yaml` file, then
    /// `MTU_HUB_*` environment variables.
    pub fn load() -> MtuResult<Self> {
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default()).map_err(|e| MtuError::config(e.to_string()))?)
            .add_source(config::File::with_name("mtu-hub").required(false))
            .add_source(config::Environment::with_prefix("MTU_HUB").separator("__"));
        let settings = builder.build().map_err(|e| MtuError::config(e.to_string()))?;
        settings
            .try_deserialize()
            .map_err(|e| MtuError::config(e.to_string()))
    }
}

/// Client-side configuration: which hub to connect to and how to identify.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub hub_ip: String,
    pub command_port: u16,
    pub publish_port: u16,
    pub requested_prefix: String,
    pub command_reply_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hub_ip: "127.0.0.1".to_string(),
            command_port: DEFAULT_CMD_SERVER_PORT,
            publish_port: DEFAULT_PUB_SERVER_PORT,
            requested_prefix: "APP".to_string(),
            command_reply_timeout_ms: 10_000,
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn command_server_addr(&self) -> String {
        format!("{}:{}", self.hub_ip, self.command_port)
    }

    #[must_use]
    pub fn publish_server_addr(&self) -> String {
        format!("{}:{}", self.hub_ip, self.publish_port)
    }
}

/// Installs the process-wide `tracing` subscriber, honoring `RUST_LOG` and
/// falling back to `info` for this crate's targets.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_config_defaults_match_constants() {
        let cfg = HubConfig::default();
        assert_eq!(cfg.command_server_port, DEFAULT_CMD_SERVER_PORT);
        assert_eq!(cfg.aggregation_window(), DEFAULT_AGGREGATION_WINDOW);
    }

    #[test]
    fn client_config_builds_addrs() {
        let cfg = ClientConfig {
            hub_ip: "10.0.0.5".to_string(),
            ..ClientConfig::default()
        };
        assert_eq!(cfg.command_server_addr(), "10.0.0.5:5200");
        assert_eq!(cfg.publish_server_addr(), "10.0.0.5:5210");
    }
}
