//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the relay.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the relay.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RelayConfig {
    /// Listener configuration (bind address, connection limit).
    pub listener: ListenerConfig,

    /// Relay engine settings.
    pub relay: EngineSettings,

    /// Multiplexed-processor settings.
    pub h2: H2Config,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Backend server definitions.
    pub backends: Vec<BackendConfig>,

    /// Route definitions mapping hints to backend groups.
    pub routes: Vec<RouteConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8443").
    pub bind_address: String,

    /// Maximum concurrent client sessions (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8443".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Which processor drives client sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorKind {
    #[default]
    H2,
    Tcp,
}

/// Relay engine settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineSettings {
    pub processor: ProcessorKind,

    /// Per-connection input buffer size in bytes.
    pub in_buffer_size: usize,

    /// Per-connection output buffer size in bytes.
    pub out_buffer_size: usize,

    /// Backend connections one session may hold (at most 1024).
    pub max_backends_per_session: u16,

    /// Overrides the processor's zero-copy threshold.
    pub zero_copy_threshold: Option<usize>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            processor: ProcessorKind::H2,
            in_buffer_size: 16 * 1024,
            out_buffer_size: 16 * 1024,
            max_backends_per_session: 1024,
            zero_copy_threshold: None,
        }
    }
}

/// Multiplexed-processor settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct H2Config {
    /// Delay before ended streams are swept, in milliseconds.
    pub stream_linger_ms: u64,
}

impl H2Config {
    pub fn stream_linger(&self) -> Duration {
        Duration::from_millis(self.stream_linger_ms)
    }
}

impl Default for H2Config {
    fn default() -> Self {
        Self {
            stream_linger_ms: 2000,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Backend connection establishment timeout in seconds.
    pub connect_secs: u64,
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { connect_secs: 5 }
    }
}

/// Route configuration mapping hints to backend groups.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route identifier for logging.
    pub name: String,

    /// Host to match (case-insensitive, port ignored).
    pub host: Option<String>,

    /// Path prefix to match.
    pub path_prefix: Option<String>,

    /// Backend group name to forward to.
    pub backend_group: String,

    /// Route priority (higher = checked first).
    #[serde(default)]
    pub priority: u32,
}

/// Backend server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Unique backend identifier.
    pub name: String,

    /// Backend group this server belongs to.
    pub group: String,

    /// Backend address (e.g., "127.0.0.1:3000").
    pub address: String,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit logs as JSON lines.
    pub json: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_file_uses_defaults() {
        let config: RelayConfig = toml::from_str(
            r#"
            [relay]
            processor = "tcp"

            [[backends]]
            name = "a1"
            group = "api"
            address = "127.0.0.1:9001"
            "#,
        )
        .unwrap();

        assert_eq!(config.relay.processor, ProcessorKind::Tcp);
        assert_eq!(config.relay.in_buffer_size, 16 * 1024);
        assert_eq!(config.h2.stream_linger(), Duration::from_secs(2));
        assert_eq!(config.backends.len(), 1);
        assert!(config.routes.is_empty());
        assert!(!config.observability.metrics_enabled);
    }
}
