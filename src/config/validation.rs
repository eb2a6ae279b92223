//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, limits > 0)
//! - Check the bind address and session cookie name are usable
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::ServerConfig;

/// One failed semantic check.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Validate a configuration, collecting every problem found.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be > 0"));
    }

    let sessions = &config.sessions;
    if sessions.cookie_name.is_empty() {
        errors.push(ValidationError::new("sessions.cookie_name", "must not be empty"));
    } else if !sessions.cookie_name.chars().all(is_token_char) {
        errors.push(ValidationError::new(
            "sessions.cookie_name",
            format!("'{}' contains characters not allowed in a cookie name", sessions.cookie_name),
        ));
    }
    if axum::http::HeaderName::from_bytes(sessions.header_name.as_bytes()).is_err() {
        errors.push(ValidationError::new(
            "sessions.header_name",
            format!("'{}' is not a valid header name", sessions.header_name),
        ));
    }
    if sessions.idle_timeout_secs == 0 {
        errors.push(ValidationError::new("sessions.idle_timeout_secs", "must be > 0"));
    }
    if sessions.sweep_interval_secs == 0 {
        errors.push(ValidationError::new("sessions.sweep_interval_secs", "must be > 0"));
    }

    let timeouts = &config.timeouts;
    for (field, value) in [
        ("timeouts.request_ms", timeouts.request_ms),
        ("timeouts.body_read_ms", timeouts.body_read_ms),
        ("timeouts.header_read_ms", timeouts.header_read_ms),
        ("timeouts.channel_send_ms", timeouts.channel_send_ms),
        ("timeouts.upgrade_grace_ms", timeouts.upgrade_grace_ms),
        ("timeouts.shutdown_grace_ms", timeouts.shutdown_grace_ms),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be > 0"));
        }
    }

    if config.limits.max_body_bytes == 0 {
        errors.push(ValidationError::new("limits.max_body_bytes", "must be > 0"));
    }
    if config.limits.channel_buffer == 0 {
        errors.push(ValidationError::new("limits.channel_buffer", "must be > 0"));
    }

    if let Some(addr) = &config.observability.metrics_address {
        if addr.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new(
                "observability.metrics_address",
                format!("'{}' is not a socket address", addr),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

// RFC 6265 cookie-name token characters.
fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ServerConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = ServerConfig::default();
        config.listener.bind_address = "nowhere".into();
        config.sessions.cookie_name = "bad name;".into();
        config.timeouts.channel_send_ms = 0;
        config.limits.channel_buffer = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                "listener.bind_address",
                "sessions.cookie_name",
                "timeouts.channel_send_ms",
                "limits.channel_buffer",
            ]
        );
    }
}
