//! Per-request context handed to route handlers.
//!
//! # Responsibilities
//! - Own the request for the duration of dispatch
//! - Carry bound route parameters, the attached session and pending
//!   response headers
//! - Give handlers access to the server's capabilities (config, shutdown,
//!   task spawning under the server's logger)
//!
//! # Design Decisions
//! - A handler either answers (`Outcome::Handled`) or hands the context
//!   back (`Outcome::NotHandled`) so the next module sees the same request
//! - Headers added before the answer exists (e.g. `Set-Cookie` for a new
//!   session) are merged into whatever response is finally produced

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::header::{HeaderMap, HeaderName, HeaderValue, COOKIE};
use axum::http::{Method, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::instrument::{WithDispatch, WithSubscriber};
use tracing::Dispatch;

use crate::config::ServerConfig;
use crate::error::{BoxError, ServerError};
use crate::lifecycle::{Shutdown, ShutdownSignal};
use crate::modules::session::{Session, SessionStore};
use crate::net::ConnectionTracker;
use crate::routing::matcher::RouteParams;

/// Header carrying the per-request correlation id.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Result of running a handler.
pub enum Outcome {
    /// The request was answered.
    Handled(Response),
    /// The handler declined; dispatch continues with the next module.
    NotHandled(Context),
}

impl Outcome {
    pub fn is_handled(&self) -> bool {
        matches!(self, Outcome::Handled(_))
    }
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Handled(response) => f
                .debug_tuple("Handled")
                .field(&response.status())
                .finish(),
            Outcome::NotHandled(ctx) => f.debug_tuple("NotHandled").field(&ctx.path()).finish(),
        }
    }
}

/// Capabilities of the running server, shared by every request and module.
#[derive(Clone)]
pub struct ServerContext {
    config: Arc<ServerConfig>,
    local_addr: SocketAddr,
    shutdown: Shutdown,
    force: Shutdown,
    channels: ConnectionTracker,
    logger: Option<Dispatch>,
    runtime: Option<Handle>,
}

impl ServerContext {
    pub(crate) fn new(
        config: Arc<ServerConfig>,
        local_addr: SocketAddr,
        shutdown: Shutdown,
        force: Shutdown,
        logger: Option<Dispatch>,
    ) -> Self {
        Self {
            config,
            local_addr,
            shutdown,
            force,
            channels: ConnectionTracker::new("channel"),
            logger,
            runtime: Handle::try_current().ok(),
        }
    }

    /// A context that is not attached to a listening server.
    ///
    /// Useful for exercising handlers directly.
    pub fn detached(config: ServerConfig) -> Self {
        Self::new(
            Arc::new(config),
            SocketAddr::from(([127, 0, 0, 1], 0)),
            Shutdown::new(),
            Shutdown::new(),
            None,
        )
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signal that fires when the server begins shutting down.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Signal that fires when the shutdown grace has run out.
    pub(crate) fn force_signal(&self) -> ShutdownSignal {
        self.force.subscribe()
    }

    /// Live duplex channels of this run.
    pub fn channels(&self) -> &ConnectionTracker {
        &self.channels
    }

    /// Run `future` under this server's logger, or under the subscriber
    /// current at the call site when none was configured.
    pub fn scoped<F: Future>(&self, future: F) -> WithDispatch<F> {
        match &self.logger {
            Some(dispatch) => future.with_subscriber(dispatch.clone()),
            None => future.with_current_subscriber(),
        }
    }

    /// Spawn a task that logs through this server's logger.
    ///
    /// Tasks land on the runtime the server was started on, so this may be
    /// called from threads outside any runtime.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match &self.runtime {
            Some(runtime) => runtime.spawn(self.scoped(future)),
            None => tokio::spawn(self.scoped(future)),
        }
    }
}

/// The request being dispatched plus everything handlers may need.
pub struct Context {
    request: Request<Body>,
    remote_addr: SocketAddr,
    params: RouteParams,
    pending_headers: HeaderMap,
    session: Option<(Arc<SessionStore>, Arc<Session>)>,
    server: ServerContext,
}

impl Context {
    pub fn new(request: Request<Body>, server: ServerContext) -> Self {
        Self {
            request,
            remote_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            params: RouteParams::default(),
            pending_headers: HeaderMap::new(),
            session: None,
            server,
        }
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = addr;
        self
    }

    pub fn request(&self) -> &Request<Body> {
        &self.request
    }

    pub(crate) fn request_mut(&mut self) -> &mut Request<Body> {
        &mut self.request
    }

    pub fn method(&self) -> &Method {
        self.request.method()
    }

    pub fn uri(&self) -> &Uri {
        self.request.uri()
    }

    pub fn path(&self) -> &str {
        self.request.uri().path()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.request.headers()
    }

    /// First value of a header, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.request.headers().get(name).and_then(|v| v.to_str().ok())
    }

    /// Value of a cookie sent with the request.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.request
            .headers()
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }

    /// Decoded query string parameter.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.request.uri().query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Correlation id assigned by the request-id layer.
    pub fn request_id(&self) -> &str {
        self.header(X_REQUEST_ID).unwrap_or("unknown")
    }

    /// Parameter bound by the matched route.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    pub fn params(&self) -> &RouteParams {
        &self.params
    }

    pub(crate) fn set_params(&mut self, params: RouteParams) {
        self.params = params;
    }

    pub fn server(&self) -> &ServerContext {
        &self.server
    }

    /// Session attached by the session module, if it ran for this request.
    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref().map(|(_, session)| session)
    }

    pub(crate) fn attached_session(&self, store: &Arc<SessionStore>) -> Option<&Arc<Session>> {
        match &self.session {
            Some((owner, session)) if Arc::ptr_eq(owner, store) => Some(session),
            _ => None,
        }
    }

    pub(crate) fn attach_session(&mut self, store: Arc<SessionStore>, session: Arc<Session>) {
        self.session = Some((store, session));
    }

    /// Add a header to whatever response this request ends up with.
    pub fn append_response_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.pending_headers.append(name, value);
    }

    /// Read the whole request body.
    ///
    /// Bounded by the configured body read timeout and size limit. The body
    /// can be taken once; later calls return an empty buffer.
    pub async fn body_bytes(&mut self) -> Result<Bytes, ServerError> {
        let body = std::mem::take(self.request.body_mut());
        let limit = self.server.config().limits.max_body_bytes;
        let bound = self.server.config().timeouts.body_read();

        match tokio::time::timeout(bound, axum::body::to_bytes(body, limit)).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(e)) => Err(ServerError::Io(io::Error::new(io::ErrorKind::InvalidData, e))),
            Err(_) => Err(ServerError::timeout("body read", bound)),
        }
    }

    pub async fn body_text(&mut self) -> Result<String, ServerError> {
        let bytes = self.body_bytes().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| ServerError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
    }

    /// Read and deserialize a JSON body.
    pub async fn body_json<T: DeserializeOwned>(&mut self) -> Result<T, BoxError> {
        let bytes = self.body_bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Answer the request.
    pub fn respond(self, response: impl IntoResponse) -> Outcome {
        Outcome::Handled(self.finish(response))
    }

    pub fn text(self, body: impl Into<String>) -> Outcome {
        self.respond(body.into())
    }

    pub fn json<T: Serialize>(self, value: &T) -> Outcome {
        self.respond(Json(value))
    }

    pub fn status(self, status: StatusCode) -> Outcome {
        self.respond(status)
    }

    /// Decline the request and pass it on.
    pub fn not_handled(self) -> Outcome {
        Outcome::NotHandled(self)
    }

    /// Turn anything into the final response, merging pending headers.
    pub(crate) fn finish(self, response: impl IntoResponse) -> Response {
        let mut response = response.into_response();
        let headers = response.headers_mut();
        let mut current: Option<HeaderName> = None;
        // HeaderMap yields `None` for repeated values of the previous name.
        for (name, value) in self.pending_headers {
            if let Some(name) = name {
                current = Some(name);
            }
            if let Some(name) = &current {
                headers.append(name.clone(), value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::SET_COOKIE;

    fn context(request: Request<Body>) -> Context {
        Context::new(request, ServerContext::detached(ServerConfig::default()))
    }

    #[test]
    fn cookies_are_parsed_from_all_cookie_headers() {
        let request = Request::builder()
            .uri("/")
            .header(COOKIE, "a=1; session-id=abc")
            .header(COOKIE, "b=2")
            .body(Body::empty())
            .unwrap();
        let ctx = context(request);
        assert_eq!(ctx.cookie("session-id"), Some("abc"));
        assert_eq!(ctx.cookie("b"), Some("2"));
        assert_eq!(ctx.cookie("missing"), None);
    }

    #[test]
    fn query_parameters_are_decoded() {
        let request = Request::builder()
            .uri("/search?q=hello%20world&n=2")
            .body(Body::empty())
            .unwrap();
        let ctx = context(request);
        assert_eq!(ctx.query_param("q").as_deref(), Some("hello world"));
        assert_eq!(ctx.query_param("x"), None);
    }

    #[test]
    fn pending_headers_are_merged_into_response() {
        let mut ctx = context(Request::new(Body::empty()));
        ctx.append_response_header(SET_COOKIE, HeaderValue::from_static("a=1"));
        ctx.append_response_header(SET_COOKIE, HeaderValue::from_static("b=2"));

        let Outcome::Handled(response) = ctx.text("ok") else {
            panic!("expected a response");
        };
        let cookies: Vec<_> = response.headers().get_all(SET_COOKIE).iter().collect();
        assert_eq!(cookies.len(), 2);
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn body_read_respects_size_limit() {
        let mut config = ServerConfig::default();
        config.limits.max_body_bytes = 4;
        let server = ServerContext::detached(config);
        let mut ctx = Context::new(Request::new(Body::from("too long")), server);
        assert!(ctx.body_bytes().await.is_err());

        let mut ctx = context(Request::new(Body::from("{\"n\":1}")));
        let value: serde_json::Value = ctx.body_json().await.unwrap();
        assert_eq!(value["n"], 1);
    }
}
