//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for an embedded server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, connection limit).
    pub listener: ListenerConfig,

    /// Route matching behaviour.
    pub routing: RoutingConfig,

    /// Session cookie and expiry policy.
    pub sessions: SessionConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Size and buffer limits.
    pub limits: LimitsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl ServerConfig {
    /// Configuration listening on every interface at `port`.
    pub fn with_port(port: u16) -> Self {
        let mut config = Self::default();
        config.listener.bind_address = format!("0.0.0.0:{}", port);
        config
    }

    /// Configuration bound to an explicit address such as `127.0.0.1:0`.
    pub fn with_bind_address(address: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.listener.bind_address = address.into();
        config
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8888").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8888".to_string(),
            max_connections: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Compare literal and regex path segments case-sensitively.
    pub case_sensitive: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            case_sensitive: true,
        }
    }
}

/// Session identification and expiry.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Cookie carrying the session token.
    pub cookie_name: String,

    /// Header consulted when the cookie is absent.
    pub header_name: String,

    /// Idle time after which a session expires.
    pub idle_timeout_secs: u64,

    /// Interval of the background purge of expired sessions.
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "session-id".to_string(),
            header_name: "x-session-id".to_string(),
            idle_timeout_secs: 30 * 60,
            sweep_interval_secs: 60,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Timeout configuration for various operations.
///
/// Millisecond resolution so tests and embedded hosts can use short bounds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Total time allowed for handling one request.
    pub request_ms: u64,

    /// Time allowed for reading a request body.
    pub body_read_ms: u64,

    /// Time allowed for a client to send request headers.
    pub header_read_ms: u64,

    /// Time allowed for one duplex channel send.
    pub channel_send_ms: u64,

    /// Time a duplex channel waits for the peer's close frame.
    pub upgrade_grace_ms: u64,

    /// Time in-flight connections get to finish after cancellation.
    pub shutdown_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_ms: 30_000,
            body_read_ms: 10_000,
            header_read_ms: 10_000,
            channel_send_ms: 5_000,
            upgrade_grace_ms: 2_000,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl TimeoutConfig {
    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn body_read(&self) -> Duration {
        Duration::from_millis(self.body_read_ms)
    }

    pub fn header_read(&self) -> Duration {
        Duration::from_millis(self.header_read_ms)
    }

    pub fn channel_send(&self) -> Duration {
        Duration::from_millis(self.channel_send_ms)
    }

    pub fn upgrade_grace(&self) -> Duration {
        Duration::from_millis(self.upgrade_grace_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Queued frames per duplex channel direction.
    pub channel_buffer: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 2 * 1024 * 1024, // 2MB
            channel_buffer: 64,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines instead of the human format.
    pub json_logs: bool,

    /// Prometheus exporter bind address; disabled when `None`.
    pub metrics_address: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_address: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_port_binds_all_interfaces() {
        let config = ServerConfig::with_port(8888);
        assert_eq!(config.listener.bind_address, "0.0.0.0:8888");
        assert!(config.listener.bind_address.contains("8888"));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            [sessions]
            cookie_name = "sid"

            [timeouts]
            shutdown_grace_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.sessions.cookie_name, "sid");
        assert_eq!(config.sessions.idle_timeout_secs, 1800);
        assert_eq!(config.timeouts.shutdown_grace(), Duration::from_millis(250));
        assert!(config.routing.case_sensitive);
    }
}
