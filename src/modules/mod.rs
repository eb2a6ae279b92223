//! Pluggable request-handling modules.
//!
//! # Data Flow
//! ```text
//! Host builds modules (web.rs, session.rs, duplex.rs, static_files.rs)
//!     → Server::register_module
//!     → registry.rs (copy-on-write, atomically published snapshot)
//!     → Dispatcher walks the snapshot in registration order
//! ```
//!
//! # Lifecycle
//! ```text
//! Registered → (on_register) → Active → (on_unregister) → Unregistered
//!                                 │
//!                                 └─ on_start once per server run
//! ```
//!
//! # Design Decisions
//! - A module is identified by its name; names are unique per server
//! - Routes are fixed once a module is registered, so a dispatch snapshot
//!   never observes a half-built module
//! - Hooks are synchronous; long-running work is spawned through the
//!   `ServerContext` so it follows the server's shutdown and logger

pub mod duplex;
pub mod registry;
pub mod session;
pub mod static_files;
pub mod web;

use crate::http::context::ServerContext;
use crate::routing::RouteMap;

pub use duplex::{channel_url, ChatRoom, DuplexModule};
pub use registry::{ModuleEntry, ModuleRegistry, ModuleState};
pub use session::{Session, SessionModule, SessionStore};
pub use static_files::{MimeLookup, StaticFilesModule};
pub use web::WebModule;

/// A named, ordered group of routes with lifecycle hooks.
pub trait Module: Send + Sync + 'static {
    /// Unique name within a server.
    fn name(&self) -> &str;

    /// Routes in match order.
    fn routes(&self) -> &[RouteMap];

    /// Called once, before the module becomes visible to dispatch.
    fn on_register(&self) {}

    /// Called when a server run starts, or at registration if the server is
    /// already running.
    fn on_start(&self, server: &ServerContext) {
        let _ = server;
    }

    /// Called once, after the module is no longer visible to new requests.
    fn on_unregister(&self) {}
}
