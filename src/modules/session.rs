//! Cookie-backed sessions with idle expiry.
//!
//! # Responsibilities
//! - Identify the client's session from a cookie, or a header as fallback
//! - Mint a session (and `Set-Cookie`) when none is presented or it expired
//! - Keep a concurrent key/value store per session
//! - Purge idle sessions in the background
//!
//! # Design Decisions
//! - `last_touched` is an atomic millisecond stamp; expiry swaps it to a
//!   sentinel with compare-and-set, and touching refuses the sentinel, so a
//!   session that lost the race against a purge can never come back
//! - Tokens are 256 random bits, hex encoded
//! - The module's only route is a catch-all that attaches the session and
//!   declines, so it must be registered before the modules that use it

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use axum::http::header::SET_COOKIE;
use axum::http::HeaderValue;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::SessionConfig;
use crate::http::context::{Context, ServerContext};
use crate::modules::Module;
use crate::observability::metrics;
use crate::routing::{handler, RouteMap, Verb};

/// `last_touched` value of a session that has been expired.
const EXPIRED: u64 = u64::MAX;

/// One client session.
#[derive(Debug)]
pub struct Session {
    id: String,
    created_at: SystemTime,
    last_touched: AtomicU64,
    values: DashMap<String, Value>,
}

impl Session {
    fn new(id: String, now_ms: u64) -> Self {
        Self {
            id,
            created_at: SystemTime::now(),
            last_touched: AtomicU64::new(now_ms),
            values: DashMap::new(),
        }
    }

    /// The session token.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|entry| entry.value().clone())
    }

    /// Typed read; `None` if missing or of another shape.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|value| serde_json::from_value(value).ok())
    }

    /// Store a value, returning the previous one.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values.insert(key.into(), value.into())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.values.remove(key).map(|(_, value)| value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&self) {
        self.values.clear();
    }
}

/// All live sessions of one session module.
#[derive(Debug)]
pub struct SessionStore {
    sessions: DashMap<String, Arc<Session>>,
    idle_timeout: Duration,
    epoch: Instant,
}

impl SessionStore {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_timeout,
            epoch: Instant::now(),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn idle_ms(&self) -> u64 {
        self.idle_timeout.as_millis() as u64
    }

    fn is_idle(&self, last_touched: u64, now: u64) -> bool {
        now.saturating_sub(last_touched) > self.idle_ms()
    }

    /// Create and store a fresh session.
    pub fn create(&self) -> Arc<Session> {
        loop {
            match self.sessions.entry(generate_token()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    let session = Arc::new(Session::new(slot.key().clone(), self.now_ms()));
                    slot.insert(Arc::clone(&session));
                    return session;
                }
            }
        }
    }

    /// Look up a live session and mark it used.
    ///
    /// An expired session is removed and reported as absent.
    pub fn get(&self, token: &str) -> Option<Arc<Session>> {
        let session = self
            .sessions
            .get(token)
            .map(|entry| Arc::clone(entry.value()))?;

        let now = self.now_ms();
        if self.touch_at(&session, now) {
            return Some(session);
        }

        self.expire_at(&session, now);
        self.sessions
            .remove_if(token, |_, current| Arc::ptr_eq(current, &session));
        None
    }

    /// Refresh the idle clock. Returns false if the session already expired.
    pub fn touch(&self, session: &Session) -> bool {
        self.touch_at(session, self.now_ms())
    }

    fn touch_at(&self, session: &Session, now: u64) -> bool {
        let mut current = session.last_touched.load(Ordering::Acquire);
        loop {
            if current == EXPIRED || self.is_idle(current, now) {
                return false;
            }
            let next = current.max(now);
            match session.last_touched.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Mark the session expired if it is idle. Returns true if it is (now)
    /// expired.
    fn expire_at(&self, session: &Session, now: u64) -> bool {
        let mut current = session.last_touched.load(Ordering::Acquire);
        loop {
            if current == EXPIRED {
                return true;
            }
            if !self.is_idle(current, now) {
                return false;
            }
            match session.last_touched.compare_exchange_weak(
                current,
                EXPIRED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn is_expired(&self, session: &Session) -> bool {
        let stamp = session.last_touched.load(Ordering::Acquire);
        stamp == EXPIRED || self.is_idle(stamp, self.now_ms())
    }

    /// End a session immediately.
    pub fn remove(&self, token: &str) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(token)?;
        session.last_touched.store(EXPIRED, Ordering::Release);
        Some(session)
    }

    /// Remove every idle session. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.now_ms();
        let mut purged = 0;
        self.sessions.retain(|_, session| {
            if self.expire_at(session, now) {
                purged += 1;
                false
            } else {
                true
            }
        });
        purged
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

fn generate_token() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    hex::encode(bytes)
}

struct SessionShared {
    store: Arc<SessionStore>,
    cookie_name: String,
    header_name: String,
}

impl SessionShared {
    fn get_or_create(&self, ctx: &mut Context) -> Arc<Session> {
        if let Some(session) = ctx.attached_session(&self.store) {
            return Arc::clone(session);
        }

        let presented = ctx
            .cookie(&self.cookie_name)
            .or_else(|| ctx.header(&self.header_name))
            .map(str::to_owned);

        if let Some(session) = presented.and_then(|token| self.store.get(&token)) {
            ctx.attach_session(Arc::clone(&self.store), Arc::clone(&session));
            return session;
        }

        let session = self.store.create();
        let cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax",
            self.cookie_name,
            session.id()
        );
        match HeaderValue::from_str(&cookie) {
            Ok(value) => ctx.append_response_header(SET_COOKIE, value),
            Err(e) => tracing::warn!(error = %e, "Session cookie is not a valid header value"),
        }
        tracing::debug!(
            request_id = %ctx.request_id(),
            live_sessions = self.store.len(),
            "Session created"
        );

        ctx.attach_session(Arc::clone(&self.store), Arc::clone(&session));
        session
    }
}

/// Attaches a session to every request that passes through it.
pub struct SessionModule {
    name: String,
    shared: Arc<SessionShared>,
    sweep_interval: Duration,
    routes: Vec<RouteMap>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionModule {
    pub fn new(config: &SessionConfig) -> Self {
        Self::with_timeouts(config, config.idle_timeout(), config.sweep_interval())
    }

    /// Like [`SessionModule::new`] with explicit idle timeout and purge
    /// interval.
    pub fn with_timeouts(config: &SessionConfig, idle_timeout: Duration, sweep_interval: Duration) -> Self {
        let shared = Arc::new(SessionShared {
            store: Arc::new(SessionStore::new(idle_timeout)),
            cookie_name: config.cookie_name.clone(),
            header_name: config.header_name.clone(),
        });

        let attach = {
            let shared = Arc::clone(&shared);
            handler(move |mut ctx: Context| {
                let shared = Arc::clone(&shared);
                async move {
                    shared.get_or_create(&mut ctx);
                    Ok(ctx.not_handled())
                }
            })
        };

        Self {
            name: "sessions".to_string(),
            shared,
            sweep_interval,
            routes: vec![RouteMap::catch_all(Verb::Any, attach)],
            sweeper: Mutex::new(None),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The session of this request, created if needed.
    pub fn get_or_create_session(&self, ctx: &mut Context) -> Arc<Session> {
        self.shared.get_or_create(ctx)
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.shared.store
    }

    pub fn cookie_name(&self) -> &str {
        &self.shared.cookie_name
    }

    pub fn session_count(&self) -> usize {
        self.shared.store.len()
    }

    pub fn purge_expired(&self) -> usize {
        let purged = self.shared.store.purge_expired();
        metrics::record_sessions_purged(purged);
        purged
    }

    fn sweeper(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Module for SessionModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn routes(&self) -> &[RouteMap] {
        &self.routes
    }

    fn on_start(&self, server: &ServerContext) {
        let store = Arc::clone(&self.shared.store);
        let period = self.sweep_interval.max(Duration::from_millis(1));
        let mut shutdown = server.shutdown_signal();

        let task = server.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        let purged = store.purge_expired();
                        metrics::record_sessions_purged(purged);
                        if purged > 0 {
                            tracing::debug!(purged, remaining = store.len(), "Expired sessions purged");
                        }
                    }
                }
            }
        });

        if let Some(previous) = self.sweeper().replace(task) {
            previous.abort();
        }
    }

    fn on_unregister(&self) {
        if let Some(task) = self.sweeper().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::http::context::Outcome;
    use axum::body::Body;
    use axum::http::header::COOKIE;
    use axum::http::Request;

    fn context_with(header: Option<(&str, String)>) -> Context {
        let mut builder = Request::builder().uri("/");
        if let Some((name, value)) = header {
            builder = builder.header(name, value);
        }
        Context::new(
            builder.body(Body::empty()).unwrap(),
            ServerContext::detached(ServerConfig::default()),
        )
    }

    fn set_cookie_count(ctx: Context) -> usize {
        let Outcome::Handled(response) = ctx.text("ok") else {
            unreachable!()
        };
        response.headers().get_all(SET_COOKIE).iter().count()
    }

    #[test]
    fn tokens_are_256_bit_hex() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_token());
    }

    #[test]
    fn session_values_round_trip() {
        let store = SessionStore::new(Duration::from_secs(60));
        let session = store.create();
        assert!(session.set("user", "ada").is_none());
        session.set("visits", 3);
        assert_eq!(session.get("user"), Some(Value::from("ada")));
        assert_eq!(session.get_as::<u32>("visits"), Some(3));
        assert_eq!(session.remove("user"), Some(Value::from("ada")));
        assert_eq!(session.len(), 1);
    }

    #[test]
    fn live_session_is_found_and_touched() {
        let store = SessionStore::new(Duration::from_secs(60));
        let session = store.create();
        let found = store.get(session.id()).unwrap();
        assert!(Arc::ptr_eq(&session, &found));
        assert!(store.get("unknown").is_none());
    }

    #[test]
    fn idle_session_expires_and_is_removed() {
        let store = SessionStore::new(Duration::from_millis(20));
        let session = store.create();
        std::thread::sleep(Duration::from_millis(60));

        assert!(store.is_expired(&session));
        assert!(store.get(session.id()).is_none());
        assert!(store.is_empty());
        assert!(!store.touch(&session));
    }

    #[test]
    fn purge_removes_only_idle_sessions() {
        let store = SessionStore::new(Duration::from_millis(40));
        let old = store.create();
        std::thread::sleep(Duration::from_millis(80));
        let fresh = store.create();

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get(fresh.id()).is_some());
        assert!(!store.touch(&old));
    }

    #[test]
    fn expired_session_is_never_revived_by_touch() {
        let store = Arc::new(SessionStore::new(Duration::from_millis(10)));
        let session = store.create();
        std::thread::sleep(Duration::from_millis(30));

        let toucher = {
            let store = Arc::clone(&store);
            let session = Arc::clone(&session);
            std::thread::spawn(move || (0..1000).filter(|_| store.touch(&session)).count())
        };
        let purged = store.purge_expired();
        let successful_touches = toucher.join().unwrap();

        assert_eq!(purged, 1);
        assert_eq!(successful_touches, 0);
        assert!(store.is_expired(&session));
    }

    #[test]
    fn new_session_sets_cookie_once_per_request() {
        let module = SessionModule::new(&SessionConfig::default());
        let mut ctx = context_with(None);
        let first = module.get_or_create_session(&mut ctx);
        let second = module.get_or_create_session(&mut ctx);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(module.session_count(), 1);
        assert_eq!(set_cookie_count(ctx), 1);
    }

    #[test]
    fn presented_cookie_resumes_session() {
        let module = SessionModule::new(&SessionConfig::default());
        let mut ctx = context_with(None);
        let session = module.get_or_create_session(&mut ctx);
        session.set("n", 1);

        let mut ctx = context_with(Some((COOKIE.as_str(), format!("session-id={}", session.id()))));
        let resumed = module.get_or_create_session(&mut ctx);
        assert_eq!(resumed.id(), session.id());
        assert_eq!(resumed.get("n"), Some(Value::from(1)));
        assert_eq!(set_cookie_count(ctx), 0);
    }

    #[test]
    fn header_is_consulted_when_cookie_is_missing() {
        let module = SessionModule::new(&SessionConfig::default());
        let session = module.store().create();

        let mut ctx = context_with(Some(("x-session-id", session.id().to_string())));
        assert_eq!(module.get_or_create_session(&mut ctx).id(), session.id());
    }

    #[tokio::test]
    async fn catch_all_route_attaches_and_declines() {
        let module = SessionModule::new(&SessionConfig::default());
        let route = &module.routes()[0];
        let outcome = (route.handler())(context_with(None)).await.unwrap();
        let Outcome::NotHandled(ctx) = outcome else {
            panic!("session route must decline");
        };
        assert!(ctx.session().is_some());
        assert_eq!(module.session_count(), 1);
    }
}
