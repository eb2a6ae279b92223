//! Embeddable HTTP server core.
//!
//! A [`Server`] hosts an ordered registry of [`Module`]s. Each request is
//! offered to the modules in registration order and the first route that
//! handles it produces the response; unanswered requests get a 404.
//! Built-in modules cover plain handlers, cookie sessions, duplex
//! (WebSocket) channels and static files.

pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod modules;
pub mod net;
pub mod observability;
pub mod routing;

pub use config::ServerConfig;
pub use error::{BoxError, ServerError};
pub use http::{
    Cancelled, ChannelEvent, CloseReason, Context, DuplexChannel, Outcome, Server, ServerContext,
    ServerTask,
};
pub use lifecycle::{Shutdown, ShutdownSignal};
pub use modules::{
    ChatRoom, DuplexModule, Module, SessionModule, StaticFilesModule, WebModule,
};
pub use routing::{handler, RouteMap, Verb};
