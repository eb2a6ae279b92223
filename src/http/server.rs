//! The embeddable server: listener, accept loop and connection handling.
//!
//! # Responsibilities
//! - Own the module registry and the dispatcher for the server's lifetime
//! - Bind the listening socket and run the accept loop under cancellation
//! - Serve each connection as its own task, isolated from the others
//! - Drain in-flight work within the grace window, then force-close the rest
//!
//! # Data Flow
//! ```text
//! start(signal)
//!     → Listener::bind (fails fast with Bind)
//!     → modules' on_start
//!     → accept loop ──→ per-connection task
//!                           → hyper HTTP/1.1 (+ upgrades)
//!                           → tower stack (request id, trace, timeout)
//!                           → Dispatcher → Response
//! signal / stop()
//!     → stop accepting, graceful shutdown of every connection
//!     → duplex channels send going-away close frames
//!     → after the grace window: abort connections, cut channels
//!     → ServerTask resolves to Cancelled
//! ```
//!
//! # Design Decisions
//! - One run at a time; a finished server may be started again
//! - Requests on one connection are handled one after another
//! - A scoped logger (`with_logger`) follows every task the server spawns

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use axum::body::{Body, Bytes};
use axum::http::{Request, Response, StatusCode};
use hyper::body::{Body as HttpBody, Incoming};
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpStream;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tower::util::BoxCloneService;
use tower::{service_fn, ServiceBuilder};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::instrument::WithSubscriber;
use tracing::Dispatch;

use crate::config::{load_config, validate_config, ConfigError, ServerConfig};
use crate::error::{BoxError, ServerError};
use crate::http::context::{Context, ServerContext};
use crate::lifecycle::{Shutdown, ShutdownSignal};
use crate::modules::{Module, ModuleRegistry};
use crate::net::{ConnectionTracker, Listener, ListenerError};
use crate::observability::metrics;
use crate::routing::Dispatcher;

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

type HttpService = BoxCloneService<Request<Incoming>, Response<Body>, Infallible>;

impl From<ListenerError> for ServerError {
    fn from(err: ListenerError) -> Self {
        match err {
            ListenerError::Bind { address, source } => ServerError::Bind { address, source },
            ListenerError::Accept(source) => ServerError::Io(source),
            ListenerError::Closed => ServerError::Cancelled,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled {
    /// Connections and channels still open when the grace window ran out.
    pub forced_connections: usize,
}

/// Handle to a running server; resolves when the run ends.
#[derive(Debug)]
pub struct ServerTask {
    handle: JoinHandle<Result<Cancelled, ServerError>>,
    local_addr: SocketAddr,
}

impl ServerTask {
    /// Address the run is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Future for ServerTask {
    type Output = Result<Cancelled, ServerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|joined| {
            joined.unwrap_or_else(|e| Err(ServerError::TaskFailed(e.to_string())))
        })
    }
}

struct RunHandle {
    context: ServerContext,
    stop: Shutdown,
}

struct ServerInner {
    config: Arc<ServerConfig>,
    registry: ModuleRegistry,
    logger: ArcSwapOption<Dispatch>,
    running: AtomicBool,
    run: Mutex<Option<RunHandle>>,
}

impl ServerInner {
    fn run_slot(&self) -> MutexGuard<'_, Option<RunHandle>> {
        self.run.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn logger(&self) -> Option<Dispatch> {
        self.logger.load_full().map(|dispatch| (*dispatch).clone())
    }

    /// Run `f` under the configured logger.
    fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        match self.logger() {
            Some(dispatch) => tracing::dispatcher::with_default(&dispatch, f),
            None => f(),
        }
    }
}

/// Clears the run state when a run ends, however it ends.
struct RunGuard {
    inner: Arc<ServerInner>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.inner.run_slot().take();
        self.inner.running.store(false, Ordering::Release);
    }
}

/// An embeddable HTTP server hosting a registry of modules.
///
/// Cheap to clone; clones share the same registry and run state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config: Arc::new(config),
                registry: ModuleRegistry::new(),
                logger: ArcSwapOption::empty(),
                running: AtomicBool::new(false),
                run: Mutex::new(None),
            }),
        }
    }

    /// A server with default settings listening on `port` on all interfaces.
    pub fn with_port(port: u16) -> Self {
        Self::new(ServerConfig::with_port(port))
    }

    /// A server configured from a TOML file.
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        Ok(Self::new(load_config(path.as_ref())?))
    }

    /// Log through `logger` instead of the process default subscriber.
    pub fn with_logger(self, logger: Dispatch) -> Self {
        self.set_logger(Some(logger));
        self
    }

    /// Replace the logger. Takes effect for the next run.
    pub fn set_logger(&self, logger: Option<Dispatch>) {
        self.inner.logger.store(logger.map(Arc::new));
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Add a module at the end of the dispatch order.
    ///
    /// If the server is running the module's `on_start` runs immediately.
    pub fn register_module(&self, module: Arc<dyn Module>) -> Result<(), ServerError> {
        let run = self.inner.run_slot();
        let entry = self.inner.in_scope(|| self.inner.registry.register(module))?;
        if let Some(run) = run.as_ref() {
            entry.module().on_start(&run.context);
        }
        Ok(())
    }

    /// Remove a module by name. In-flight requests that already selected it
    /// finish normally.
    pub fn unregister_module(&self, name: &str) -> Result<(), ServerError> {
        self.inner
            .in_scope(|| self.inner.registry.unregister(name))
            .map(|_| ())
    }

    /// Module names in dispatch order.
    pub fn modules(&self) -> Vec<String> {
        self.inner.registry.names()
    }

    pub fn module_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Address of the current run, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .run_slot()
            .as_ref()
            .map(|run| run.context.local_addr())
    }

    /// Bind and start serving until `signal` fires or [`Server::stop`] is
    /// called.
    ///
    /// The configuration is validated and the socket bound before this
    /// returns, so bad settings are reported here as `Config` and an
    /// unavailable address as `Bind`. The signal also fires when its `Shutdown`
    /// is dropped, so keep the coordinator alive for the run.
    pub async fn start(&self, signal: ShutdownSignal) -> Result<ServerTask, ServerError> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ServerError::AlreadyRunning);
        }

        if let Err(errors) = validate_config(&self.inner.config) {
            self.inner.running.store(false, Ordering::Release);
            let err = ServerError::from(ConfigError::Validation(errors));
            self.inner
                .in_scope(|| tracing::error!(error = %err, "Server failed to start"));
            return Err(err);
        }

        let logger = self.inner.logger();
        let listener_config = &self.inner.config.listener;
        let bound = match &logger {
            Some(dispatch) => {
                Listener::bind(listener_config)
                    .with_subscriber(dispatch.clone())
                    .await
            }
            None => Listener::bind(listener_config).await,
        };
        let bound = bound.and_then(|listener| {
            let addr = listener.local_addr().map_err(ListenerError::Accept)?;
            Ok((listener, addr))
        });
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                self.inner.running.store(false, Ordering::Release);
                let err = ServerError::from(e);
                self.inner
                    .in_scope(|| tracing::error!(error = %err, "Server failed to start"));
                return Err(err);
            }
        };

        let stop = Shutdown::new();
        let force = Shutdown::new();
        let context = ServerContext::new(
            Arc::clone(&self.inner.config),
            local_addr,
            stop.clone(),
            force.clone(),
            logger,
        );

        {
            let mut run = self.inner.run_slot();
            *run = Some(RunHandle {
                context: context.clone(),
                stop: stop.clone(),
            });
            for entry in self.inner.registry.snapshot().iter() {
                entry.module().on_start(&context);
            }
        }

        let guard = RunGuard {
            inner: Arc::clone(&self.inner),
        };
        let handle = context.spawn(serve(
            guard,
            listener,
            context.clone(),
            stop,
            force,
            signal,
        ));

        Ok(ServerTask { handle, local_addr })
    }

    /// Begin a graceful stop of the current run. No-op when not running.
    pub fn stop(&self) {
        if let Some(run) = self.inner.run_slot().as_ref() {
            run.stop.trigger();
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("bind_address", &self.inner.config.listener.bind_address)
            .field("modules", &self.modules())
            .field("running", &self.is_running())
            .finish()
    }
}

/// The accept loop of one run.
async fn serve(
    guard: RunGuard,
    listener: Listener,
    context: ServerContext,
    stop: Shutdown,
    force: Shutdown,
    mut external: ShutdownSignal,
) -> Result<Cancelled, ServerError> {
    let config = Arc::clone(&guard.inner.config);
    let dispatcher = Dispatcher::new(guard.inner.registry.clone(), config.routing.case_sensitive);
    let tracker = ConnectionTracker::new("http");
    let mut internal = stop.subscribe();
    let mut connections = JoinSet::new();

    tracing::info!(
        address = %context.local_addr(),
        modules = guard.inner.registry.len(),
        "Server started"
    );

    loop {
        tokio::select! {
            _ = external.recv() => {
                tracing::info!("Cancellation signal received");
                break;
            }
            _ = internal.recv() => {
                tracing::info!("Stop requested");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer, permit)) => {
                    let tracked = tracker.track();
                    let app = App {
                        dispatcher: dispatcher.clone(),
                        server: context.clone(),
                        peer,
                    };
                    let shutdown = stop.subscribe();
                    let timeouts = config.timeouts.clone();
                    connections.spawn(context.scoped(async move {
                        let _permit = permit;
                        let _tracked = tracked;
                        serve_connection(stream, app, shutdown, timeouts.header_read(), timeouts.request()).await;
                    }));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        tracing::error!(error = %e, "Connection task panicked");
                    }
                }
            }
        }
    }

    // 1. Stop accepting and tell every connection and channel.
    stop.trigger();
    drop(listener);
    let grace = config.timeouts.shutdown_grace();
    let deadline = Instant::now() + grace;
    tracing::info!(
        connections = connections.len(),
        channels = context.channels().active_count(),
        grace_ms = grace.as_millis() as u64,
        "Draining"
    );

    // 2. Let in-flight requests finish within the grace window.
    let drained = tokio::time::timeout_at(deadline, async {
        while connections.join_next().await.is_some() {}
    })
    .await
    .is_ok();

    let mut forced = 0;
    if !drained {
        forced += connections.len();
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }

    // 3. Channels close themselves on the same signal; cut the stragglers.
    let channels = context.channels();
    let remaining = deadline.saturating_duration_since(Instant::now());
    if !channels.wait_idle(remaining).await {
        forced += channels.active_count() as usize;
        force.trigger();
        let cutoff = config.timeouts.upgrade_grace() * 3;
        if !channels.wait_idle(cutoff).await {
            tracing::warn!(channels = channels.active_count(), "Channels still open after forced close");
        }
    }

    if forced > 0 {
        tracing::warn!(forced_connections = forced, "Grace window elapsed, connections forced closed");
    }
    tracing::info!("Server stopped");
    drop(guard);
    Ok(Cancelled {
        forced_connections: forced,
    })
}

/// Per-connection request handler.
struct App {
    dispatcher: Dispatcher,
    server: ServerContext,
    peer: SocketAddr,
}

impl App {
    async fn handle(&self, request: Request<Incoming>) -> Response<Body> {
        let start = std::time::Instant::now();
        let method = request.method().clone();
        let ctx = Context::new(request.map(Body::new), self.server.clone()).with_remote_addr(self.peer);
        let response = self.dispatcher.dispatch(ctx).await;
        metrics::record_request(method.as_str(), response.status().as_u16(), start);
        response
    }
}

fn into_axum_body<B>(response: Response<B>) -> Response<Body>
where
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    response.map(Body::new)
}

/// Middleware stack around the dispatcher for one connection.
fn http_service(app: App, request_timeout: Duration) -> HttpService {
    let app = Arc::new(app);
    let dispatch = service_fn(move |request: Request<Incoming>| {
        let app = Arc::clone(&app);
        async move { Ok::<_, Infallible>(app.handle(request).await) }
    });

    let stack = ServiceBuilder::new()
        .map_response(into_axum_body)
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .service(dispatch);

    BoxCloneService::new(stack)
}

async fn serve_connection(
    stream: TcpStream,
    app: App,
    mut shutdown: ShutdownSignal,
    header_read: Duration,
    request_timeout: Duration,
) {
    let peer = app.peer;
    let service = TowerToHyperService::new(http_service(app, request_timeout));

    let mut builder = http1::Builder::new();
    builder.timer(TokioTimer::new()).header_read_timeout(header_read);
    let connection = builder
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = shutdown.recv() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };

    if let Err(e) = result {
        tracing::debug!(peer = %peer, error = %e, "Connection ended with error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.listener.bind_address = "127.0.0.1:0".to_string();
        config.timeouts.shutdown_grace_ms = 500;
        config
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_running() {
        let server = Server::new(local_config());
        let shutdown = Shutdown::new();
        let task = server.start(shutdown.subscribe()).await.unwrap();
        assert!(server.is_running());
        assert_eq!(server.local_addr(), Some(task.local_addr()));

        assert!(matches!(
            server.start(shutdown.subscribe()).await,
            Err(ServerError::AlreadyRunning)
        ));
        assert!(server.is_running());

        shutdown.trigger();
        let cancelled = task.await.unwrap();
        assert_eq!(cancelled.forced_connections, 0);
        assert!(!server.is_running());
        assert_eq!(server.local_addr(), None);
    }

    #[tokio::test]
    async fn stop_ends_the_run() {
        let server = Server::new(local_config());
        let shutdown = Shutdown::new();
        let task = server.start(shutdown.subscribe()).await.unwrap();
        server.stop();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("run should end promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn invalid_address_is_a_bind_error() {
        let mut config = local_config();
        config.listener.bind_address = "not an address".to_string();
        let server = Server::new(config);
        let shutdown = Shutdown::new();
        assert!(matches!(
            server.start(shutdown.subscribe()).await,
            Err(ServerError::Bind { .. })
        ));
        assert!(!server.is_running());
    }
}
