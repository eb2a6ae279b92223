//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (method, path)
//!     → dispatcher.rs (walk registry snapshot, module by module)
//!     → route.rs (verb filter)
//!     → matcher.rs (path template, bound parameters)
//!     → handler: Handled(response) or NotHandled(context) → next module
//!     → no handler: 404
//! ```
//!
//! # Design Decisions
//! - Route patterns are parsed and compiled when a module is built, never
//!   per request
//! - Deterministic: same registry and request always reach the same handler
//! - First match wins (registration order, then route order within a module)

pub mod dispatcher;
pub mod matcher;
pub mod route;

pub use dispatcher::Dispatcher;
pub use matcher::{PathTemplate, RouteParams};
pub use route::{handler, Handler, HandlerFuture, RouteMap, Verb};
