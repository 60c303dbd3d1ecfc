//! Configuration schema definitions

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::broker::{ConnectionParams, Credentials};

/// Root configuration for heartbridge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Broker the bridge consumes from
    #[serde(default = "EndpointConfig::upstream")]
    pub upstream: EndpointConfig,
    /// Broker the bridge republishes to
    #[serde(default = "EndpointConfig::downstream")]
    pub downstream: EndpointConfig,
    /// Bridge behaviour
    #[serde(default)]
    pub bridge: BridgeConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream: EndpointConfig::upstream(),
            downstream: EndpointConfig::downstream(),
            bridge: BridgeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// One broker endpoint and the queue used on it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    pub virtual_host: String,
    pub username: String,
    pub password: String,
    /// Heartbeat interval in seconds; unset uses the broker default, 0 disables
    #[serde(default)]
    pub heartbeat_s: Option<u64>,
    /// Queue consumed from (upstream) or published to (downstream)
    pub queue: String,
}

impl EndpointConfig {
    /// Defaults for the inbound side
    pub fn upstream() -> Self {
        Self {
            host: "rabbitmq_upstream".to_string(),
            port: 5672,
            virtual_host: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            heartbeat_s: None,
            queue: "upstream_queue".to_string(),
        }
    }

    /// Defaults for the outbound side. The short heartbeat makes broken
    /// heartbeat handling show up within seconds.
    pub fn downstream() -> Self {
        Self {
            host: "rabbitmq_downstream".to_string(),
            heartbeat_s: Some(10),
            queue: "downstream_queue".to_string(),
            ..Self::upstream()
        }
    }

    /// Build connection parameters for this endpoint
    pub fn connection_params(&self, connection_name: &str) -> ConnectionParams {
        let mut params = ConnectionParams::new(self.host.clone())
            .with_virtual_host(self.virtual_host.clone())
            .with_credentials(Credentials::new(
                self.username.clone(),
                self.password.clone(),
            ))
            .with_connection_name(connection_name);
        params.port = self.port;
        if let Some(secs) = self.heartbeat_s {
            params = params.with_heartbeat(Duration::from_secs(secs));
        }
        params
    }
}

/// Bridge behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Republish inbound items downstream. When false, items are only logged.
    #[serde(default = "default_true")]
    pub forward: bool,
    /// Pump heartbeats on the outbound connection. Turning this off
    /// reproduces a publisher that lets its connection starve.
    #[serde(default = "default_true")]
    pub service_heartbeats: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            forward: true,
            service_heartbeats: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Directory for log files
    #[serde(default = "default_log_dir")]
    pub dir: String,
    /// Module-specific overrides
    #[serde(default)]
    pub overrides: HashMap<String, String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            dir: default_log_dir(),
            overrides: HashMap::new(),
        }
    }
}
