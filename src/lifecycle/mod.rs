//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Host triggers Shutdown / calls Server::stop
//!     → accept loop stops accepting
//!     → connections drain within the grace window
//!     → duplex channels send a going-away close frame
//!     → remaining connections are force-closed
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → trigger a Shutdown (host opt-in)
//! ```
//!
//! # Design Decisions
//! - The cancellation signal is the sole shutdown trigger
//! - Shutdown has a deadline: forced close after the grace window

pub mod shutdown;
pub mod signals;

pub use shutdown::{Shutdown, ShutdownSignal};
