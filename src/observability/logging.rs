//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the process-wide logging subscriber for a host
//! - Build a scoped `Dispatch` that one server instance logs through
//!
//! # Design Decisions
//! - Uses the tracing crate; the server only emits events and never picks a backend
//! - JSON format for production, human format for development
//! - `RUST_LOG` overrides the configured level

use tracing::Dispatch;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

fn filter(config: &ObservabilityConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
}

fn subscriber(config: &ObservabilityConfig) -> impl tracing::Subscriber + Send + Sync + 'static {
    let json = config.json_logs;
    tracing_subscriber::registry()
        .with(filter(config))
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer()))
}

/// Install the process-wide default subscriber.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(
    config: &ObservabilityConfig,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    subscriber(config).try_init()
}

/// Build a dispatch suitable for `Server::with_logger`.
pub fn dispatch_for(config: &ObservabilityConfig) -> Dispatch {
    Dispatch::new(subscriber(config))
}
