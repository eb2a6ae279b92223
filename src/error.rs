//! Error taxonomy for the server core.
//!
//! # Recovery boundaries
//! - `Bind`, `AlreadyRunning`: surfaced to the caller of `Server::start`
//! - `RouteHandlerFault`: recovered by the dispatcher, answered with a 500
//! - `Timeout`: recovered at the connection boundary, connection closed
//! - `Upgrade`: recovered by the duplex module, request falls through
//! - `Cancelled`: the expected end of a run, never a fault

use std::time::Duration;

use crate::config::loader::ConfigError;

/// Boxed error returned by route handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by the server core.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listening endpoint could not be acquired.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// `start` was called on a server that is already serving.
    #[error("server is already running")]
    AlreadyRunning,

    /// A route handler returned an error or panicked.
    #[error("handler for module '{module}' failed: {message}")]
    RouteHandlerFault { module: String, message: String },

    /// A body read, response write or channel send exceeded its bound.
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    /// The protocol upgrade handshake was rejected.
    #[error("upgrade rejected: {0}")]
    Upgrade(String),

    /// The server was stopped through its cancellation signal.
    #[error("server run was cancelled")]
    Cancelled,

    #[error("module '{0}' is already registered")]
    ModuleAlreadyRegistered(String),

    #[error("module '{0}' is not registered")]
    ModuleNotRegistered(String),

    #[error("invalid route pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The accept loop task itself died (panic or abort).
    #[error("server task failed: {0}")]
    TaskFailed(String),
}

impl ServerError {
    /// Construct a timeout error for the named operation.
    pub fn timeout(operation: &'static str, elapsed: Duration) -> Self {
        Self::Timeout { operation, elapsed }
    }

    /// Returns true for the timeout variant.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_detected_through_box() {
        let err: BoxError = Box::new(ServerError::timeout("body read", Duration::from_millis(5)));
        let server_err = err.downcast_ref::<ServerError>().unwrap();
        assert!(server_err.is_timeout());
        assert_eq!(server_err.to_string(), "body read timed out after 5ms");
    }

    #[test]
    fn fault_message_has_module_name() {
        let err = ServerError::RouteHandlerFault {
            module: "people".into(),
            message: "boom".into(),
        };
        assert!(err.to_string().contains("'people'"));
    }
}
