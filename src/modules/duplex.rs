//! Module that upgrades matching requests to duplex channels.
//!
//! # Responsibilities
//! - Validate the upgrade handshake on the module's channel paths
//! - Run each accepted channel: pump task plus the application handler
//! - Track live channels so server shutdown can wait for them
//!
//! # Design Decisions
//! - A request on a channel path that is not a valid upgrade is declined,
//!   not rejected, so a later module may still answer it
//! - The application handler owns the `DuplexChannel`; once the channel is
//!   closed the handler gets the close grace to wind down, then is aborted

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::FromRequestParts;
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use futures_util::future::{join_all, BoxFuture};
use tokio::time::timeout;
use url::Url;
use uuid::Uuid;

use crate::error::ServerError;
use crate::http::context::{Context, ServerContext};
use crate::http::websocket::{self, ChannelError, ChannelLimits, ChannelSender, DuplexChannel};
use crate::modules::Module;
use crate::routing::{handler, RouteMap, Verb};

/// Application side of a channel path.
pub type ChannelHandler = Arc<dyn Fn(DuplexChannel) -> BoxFuture<'static, ()> + Send + Sync>;

/// Serves duplex channels on one or more paths.
#[derive(Debug)]
pub struct DuplexModule {
    name: String,
    routes: Vec<RouteMap>,
}

impl DuplexModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routes: Vec::new(),
        }
    }

    /// Serve channels on `path`; `f` runs once per accepted channel.
    pub fn add_channel<F, Fut>(&mut self, path: &str, f: F) -> Result<&mut Self, ServerError>
    where
        F: Fn(DuplexChannel) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let on_channel: ChannelHandler =
            Arc::new(move |channel: DuplexChannel| -> BoxFuture<'static, ()> { Box::pin(f(channel)) });

        let route = handler(move |mut ctx: Context| {
            let on_channel = Arc::clone(&on_channel);
            async move {
                match try_upgrade(&mut ctx, on_channel).await {
                    Ok(response) => Ok(ctx.respond(response)),
                    Err(e) => {
                        tracing::debug!(
                            request_id = %ctx.request_id(),
                            path = %ctx.path(),
                            error = %e,
                            "Not a channel request, passing on"
                        );
                        Ok(ctx.not_handled())
                    }
                }
            }
        });

        self.routes.push(RouteMap::new(path, Verb::Get, route)?);
        Ok(self)
    }

    /// Builder form of [`DuplexModule::add_channel`].
    pub fn on_channel<F, Fut>(mut self, path: &str, f: F) -> Result<Self, ServerError>
    where
        F: Fn(DuplexChannel) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_channel(path, f)?;
        Ok(self)
    }
}

impl Module for DuplexModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn routes(&self) -> &[RouteMap] {
        &self.routes
    }
}

/// Attempt the upgrade handshake for the request in `ctx`.
///
/// On success returns the `101 Switching Protocols` response; the channel
/// starts once the client has received it. On failure the request is left
/// intact in `ctx`.
pub async fn try_upgrade(ctx: &mut Context, on_channel: ChannelHandler) -> Result<Response, ServerError> {
    let (mut parts, body) = std::mem::take(ctx.request_mut()).into_parts();
    let upgrade = WebSocketUpgrade::from_request_parts(&mut parts, &()).await;
    *ctx.request_mut() = Request::from_parts(parts, body);
    let upgrade = upgrade.map_err(|rejection| ServerError::Upgrade(rejection.body_text()))?;

    let server = ctx.server().clone();
    let path = ctx.path().to_string();
    let peer = ctx.remote_addr();
    let failed_path = path.clone();

    let response = upgrade
        .on_failed_upgrade(move |error| {
            tracing::warn!(path = %failed_path, error = %error, "Channel upgrade failed");
        })
        .on_upgrade(move |socket| {
            let scope = server.clone();
            scope.scoped(run_channel(socket, server, on_channel, path, peer))
        });

    Ok(response.into_response())
}

async fn run_channel(
    socket: WebSocket,
    server: ServerContext,
    on_channel: ChannelHandler,
    path: String,
    peer: SocketAddr,
) {
    let _tracked = server.channels().track();
    let config = server.config();
    let limits = ChannelLimits {
        buffer: config.limits.channel_buffer,
        send_timeout: config.timeouts.channel_send(),
        close_grace: config.timeouts.upgrade_grace(),
    };

    let (channel, pump) = websocket::open(
        socket,
        &path,
        limits,
        server.shutdown_signal(),
        server.force_signal(),
    );
    let channel_id = channel.id();
    pump.mark_open();
    tracing::info!(channel_id = %channel_id, path = %path, peer = %peer, "Channel opened");

    let mut app = server.spawn(on_channel(channel));
    let reason = pump.run().await;
    tracing::info!(channel_id = %channel_id, reason = ?reason, "Channel closed");

    match timeout(limits.close_grace, &mut app).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_panic() => {
            tracing::error!(channel_id = %channel_id, "Channel handler panicked");
        }
        Ok(Err(_)) => {}
        Err(_) => {
            tracing::debug!(channel_id = %channel_id, "Channel handler outlived its channel, aborting");
            app.abort();
        }
    }
}

/// Fan-out helper for chat-style channels.
#[derive(Debug, Clone, Default)]
pub struct ChatRoom {
    members: Arc<DashMap<Uuid, ChannelSender>>,
}

impl ChatRoom {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, channel: &DuplexChannel) {
        self.members.insert(channel.id(), channel.sender());
    }

    pub fn leave(&self, id: Uuid) {
        self.members.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Send to every member. Returns the number of members reached.
    pub async fn broadcast(&self, text: &str) -> usize {
        self.send_all(None, text).await
    }

    /// Send to every member except `from`.
    pub async fn broadcast_except(&self, from: Uuid, text: &str) -> usize {
        self.send_all(Some(from), text).await
    }

    async fn send_all(&self, skip: Option<Uuid>, text: &str) -> usize {
        let members: Vec<ChannelSender> = self
            .members
            .iter()
            .filter(|entry| Some(*entry.key()) != skip)
            .map(|entry| entry.value().clone())
            .collect();

        let results = join_all(members.iter().map(|member| member.send(text))).await;

        let mut delivered = 0;
        for (member, result) in members.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(ChannelError::Closed) => {
                    self.members.remove(&member.id());
                }
                Err(e) => tracing::warn!(channel_id = %member.id(), error = %e, "Broadcast send failed"),
            }
        }
        delivered
    }
}

/// URL a client uses to open a channel on `path` at `addr`.
pub fn channel_url(addr: SocketAddr, path: &str, secure: bool) -> Result<Url, url::ParseError> {
    let scheme = if secure { "wss" } else { "ws" };
    Url::parse(&format!("{}://{}", scheme, addr))?.join(path)
}
