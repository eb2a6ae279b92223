//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML) or ServerConfig::default()
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated, immutable)
//!     → shared via Arc by the server, dispatcher and modules
//! ```
//!
//! # Design Decisions
//! - Config is immutable once a server is constructed
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    LimitsConfig, ListenerConfig, ObservabilityConfig, RoutingConfig, ServerConfig,
    SessionConfig, TimeoutConfig,
};
pub use validation::{validate_config, ValidationError};
