//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (hyper HTTP/1.1 with upgrades, tower stack)
//!     → context.rs (request + route params + session + pending headers)
//!     → [Dispatcher walks the module snapshot]
//!     → response.rs (canned 404 / 408 / 500 bodies)
//!     → Send to client
//!
//! Upgraded requests:
//!     → websocket.rs (duplex channel, close exactly once)
//! ```

pub mod context;
pub mod response;
pub mod server;
pub mod websocket;

pub use context::{Context, Outcome, ServerContext, X_REQUEST_ID};
pub use server::{Cancelled, Server, ServerTask};
pub use websocket::{
    ChannelError, ChannelEvent, ChannelLimits, ChannelSender, ChannelState, CloseReason,
    DuplexChannel,
};
