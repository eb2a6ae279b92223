//! Connection lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count live connections and upgraded channels
//! - Let shutdown wait (bounded) until every tracked connection is gone

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Tracks live connections for graceful shutdown.
///
/// The count lives in a watch channel so waiters wake on the transition to
/// zero instead of polling.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    kind: &'static str,
    count: Arc<watch::Sender<u64>>,
}

impl ConnectionTracker {
    /// Create a tracker; `kind` labels log lines and the metrics gauge.
    pub fn new(kind: &'static str) -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            kind,
            count: Arc::new(tx),
        }
    }

    /// Record a new live connection. Returns a guard that decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        self.count.send_modify(|n| *n += 1);
        crate::observability::metrics::record_active(self.kind, self.active_count());
        ConnectionGuard {
            tracker: self.clone(),
            id: ConnectionId::new(),
        }
    }

    pub fn active_count(&self) -> u64 {
        *self.count.borrow()
    }

    /// Wait until no tracked connection is left, or `limit` elapses.
    ///
    /// Returns true when the tracker drained in time.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let mut rx = self.count.subscribe();
        let drained = tokio::time::timeout(limit, rx.wait_for(|n| *n == 0))
            .await
            .is_ok();
        drained
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements the live count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: ConnectionTracker,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.count.send_modify(|n| *n = n.saturating_sub(1));
        crate::observability::metrics::record_active(self.tracker.kind, self.tracker.active_count());
        tracing::trace!(connection_id = %self.id, kind = self.tracker.kind, "Connection closed");
    }
}
