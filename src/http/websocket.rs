//! Duplex text channels over upgraded WebSocket connections.
//!
//! # Responsibilities
//! - Own the socket in a single pump task (reads, writes, close handshake)
//! - Hand the application a channel: inbound events, a cloneable sender
//! - Report the end of the channel exactly once, whatever ended it
//!
//! # Data Flow
//! ```text
//! Peer ──frames──→ pump ──ChannelEvent::Message──→ DuplexChannel::recv
//! ChannelSender::send ──outbound queue──→ pump ──frames──→ Peer
//!
//! shutdown / local close / peer close / transport error
//!     → pump records the CloseReason, state = Closed
//!     → inbound queue ends → recv yields ChannelEvent::Closed once, then None
//! ```
//!
//! # State Machine
//! ```text
//! Connecting → Open → Closing → Closed
//!                └──────────────→ Closed   (transport failure)
//! ```
//!
//! # Design Decisions
//! - Only the pump touches the socket, so there is no lock around it and
//!   no second party that could report the close
//! - Every send is bounded by the channel send timeout
//! - While the application's inbound queue is full the pump stops reading
//!   but keeps writing, so an application replying to each message never
//!   waits on the pump
//! - Binary frames are delivered as (lossy) UTF-8 text
//! - Server shutdown sends close code 1001 (going away), a local close 1000

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout, Instant};
use uuid::Uuid;

use crate::lifecycle::ShutdownSignal;

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_POLICY: u16 = 1008;

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Connecting,
            1 => ChannelState::Open,
            2 => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }
}

/// Why a channel ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The application closed the channel (or dropped every sender).
    Local,
    /// The peer sent a close frame.
    Remote { code: Option<u16>, reason: String },
    /// The server is shutting down.
    Shutdown,
    /// A send or delivery exceeded its bound.
    Timeout,
    /// The connection failed without a close handshake.
    Transport(String),
}

/// What the application receives from a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Message(String),
    Closed(CloseReason),
}

/// Errors returned by channel sends.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,

    #[error("channel send timed out after {0:?}")]
    Timeout(Duration),
}

/// Bounds applied to one channel.
#[derive(Debug, Clone, Copy)]
pub struct ChannelLimits {
    /// Queued messages per direction.
    pub buffer: usize,
    /// Bound on one send, enqueue or socket write.
    pub send_timeout: Duration,
    /// Time the close handshake may take.
    pub close_grace: Duration,
}

#[derive(Debug)]
enum Outbound {
    Text(String),
    Close,
}

#[derive(Debug)]
struct Shared {
    id: Uuid,
    state: AtomicU8,
    reason: OnceLock<CloseReason>,
    closed: watch::Sender<bool>,
}

impl Shared {
    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Record the end of the channel. Only the first call has any effect.
    fn finish(&self, reason: CloseReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.set_state(ChannelState::Closed);
        self.closed.send_replace(true);
        first
    }
}

/// Cloneable handle for sending on, and closing, a channel.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Outbound>,
    send_timeout: Duration,
}

impl ChannelSender {
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Queue a text message.
    ///
    /// Fails with `Closed` unless the channel is open, and with `Timeout` if
    /// the queue stays full for the send timeout.
    pub async fn send(&self, text: impl Into<String>) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        self.outbound
            .send_timeout(Outbound::Text(text.into()), self.send_timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => ChannelError::Timeout(self.send_timeout),
                mpsc::error::SendTimeoutError::Closed(_) => ChannelError::Closed,
            })
    }

    /// Start the close handshake. Idempotent.
    pub async fn close(&self) {
        if self.state() == ChannelState::Closed {
            return;
        }
        let _ = self
            .outbound
            .send_timeout(Outbound::Close, self.send_timeout)
            .await;
    }

    /// Wait until the channel is closed.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Why the channel ended, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.reason.get().cloned()
    }
}

/// The application's end of a channel.
#[derive(Debug)]
pub struct DuplexChannel {
    sender: ChannelSender,
    inbound: mpsc::Receiver<String>,
    close_delivered: bool,
    path: String,
}

impl DuplexChannel {
    pub fn id(&self) -> Uuid {
        self.sender.id()
    }

    /// Request path the channel was opened on.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> ChannelState {
        self.sender.state()
    }

    /// A handle that can send from other tasks.
    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    pub async fn send(&self, text: impl Into<String>) -> Result<(), ChannelError> {
        self.sender.send(text).await
    }

    pub async fn close(&self) {
        self.sender.close().await
    }

    /// Next event.
    ///
    /// Yields messages in arrival order, then `ChannelEvent::Closed` exactly
    /// once, then `None`.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        if self.close_delivered {
            return None;
        }
        match self.inbound.recv().await {
            Some(text) => Some(ChannelEvent::Message(text)),
            None => {
                self.close_delivered = true;
                let reason = self
                    .sender
                    .close_reason()
                    .unwrap_or_else(|| CloseReason::Transport("channel dropped".to_string()));
                Some(ChannelEvent::Closed(reason))
            }
        }
    }
}

/// Owner of the socket for one channel.
pub(crate) struct ChannelPump {
    socket: WebSocket,
    shared: Arc<Shared>,
    outbound: mpsc::Receiver<Outbound>,
    inbound: mpsc::Sender<String>,
    shutdown: ShutdownSignal,
    force: ShutdownSignal,
    limits: ChannelLimits,
}

/// Split an upgraded socket into the application channel and its pump.
pub(crate) fn open(
    socket: WebSocket,
    path: &str,
    limits: ChannelLimits,
    shutdown: ShutdownSignal,
    force: ShutdownSignal,
) -> (DuplexChannel, ChannelPump) {
    let buffer = limits.buffer.max(1);
    let (out_tx, out_rx) = mpsc::channel(buffer);
    let (in_tx, in_rx) = mpsc::channel(buffer);
    let (closed, _) = watch::channel(false);

    let shared = Arc::new(Shared {
        id: Uuid::new_v4(),
        state: AtomicU8::new(ChannelState::Connecting as u8),
        reason: OnceLock::new(),
        closed,
    });

    let channel = DuplexChannel {
        sender: ChannelSender {
            shared: Arc::clone(&shared),
            outbound: out_tx,
            send_timeout: limits.send_timeout,
        },
        inbound: in_rx,
        close_delivered: false,
        path: path.to_string(),
    };

    let pump = ChannelPump {
        socket,
        shared,
        outbound: out_rx,
        inbound: in_tx,
        shutdown,
        force,
        limits,
    };

    (channel, pump)
}

impl ChannelPump {
    /// The handshake is done; sends are accepted from here on.
    pub(crate) fn mark_open(&self) {
        self.shared.set_state(ChannelState::Open);
    }

    /// Run until the channel ends. Returns the reason it ended.
    pub(crate) async fn run(self) -> CloseReason {
        let ChannelPump {
            mut socket,
            shared,
            mut outbound,
            inbound,
            mut shutdown,
            mut force,
            limits,
        } = self;

        // An inbound message waiting for room in the application's queue.
        // Reading stops while one is pending; writing does not.
        let mut pending: Option<Pending> = None;

        let reason = loop {
            let stall_deadline = pending.as_ref().map_or_else(Instant::now, |p| p.deadline);

            tokio::select! {
                _ = force.recv() => break CloseReason::Shutdown,

                _ = shutdown.recv() => {
                    shared.set_state(ChannelState::Closing);
                    close_handshake(&mut socket, CLOSE_GOING_AWAY, "server shutting down", limits.close_grace).await;
                    break CloseReason::Shutdown;
                }

                queued = outbound.recv() => match queued {
                    Some(Outbound::Text(text)) => {
                        match timeout(limits.send_timeout, socket.send(Message::Text(text.into()))).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => break CloseReason::Transport(e.to_string()),
                            Err(_) => break CloseReason::Timeout,
                        }
                    }
                    // An explicit close, or every sender is gone.
                    Some(Outbound::Close) | None => {
                        shared.set_state(ChannelState::Closing);
                        close_handshake(&mut socket, CLOSE_NORMAL, "", limits.close_grace).await;
                        break CloseReason::Local;
                    }
                },

                permit = inbound.reserve(), if pending.is_some() => {
                    let held = pending.take();
                    // A dropped receiver means the application stopped listening.
                    if let (Ok(permit), Some(held)) = (permit, held) {
                        permit.send(held.text);
                    }
                }

                _ = sleep_until(stall_deadline), if pending.is_some() => {
                    shared.set_state(ChannelState::Closing);
                    close_handshake(&mut socket, CLOSE_POLICY, "receiver stalled", limits.close_grace).await;
                    break CloseReason::Timeout;
                }

                incoming = socket.recv(), if pending.is_none() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        pending = offer(&inbound, text.as_str().to_owned(), limits.send_timeout);
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        pending = offer(&inbound, text, limits.send_timeout);
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        shared.set_state(ChannelState::Closing);
                        // Reading on flushes the automatic close reply.
                        let _ = timeout(limits.close_grace, drain(&mut socket)).await;
                        let (code, reason) = match frame {
                            Some(CloseFrame { code, reason }) => (Some(code), reason.as_str().to_owned()),
                            None => (None, String::new()),
                        };
                        break CloseReason::Remote { code, reason };
                    }
                    Some(Err(e)) => break CloseReason::Transport(e.to_string()),
                    None => break CloseReason::Transport("connection closed without close frame".to_string()),
                },
            }
        };

        shared.finish(reason.clone());
        drop(inbound);
        reason
    }
}

/// Inbound message the application has not made room for yet.
struct Pending {
    text: String,
    deadline: Instant,
}

/// Hand an inbound message to the application without waiting.
///
/// Returns the message back as pending when the queue is full. A dropped
/// receiver is not an error: the message is discarded.
fn offer(inbound: &mpsc::Sender<String>, text: String, bound: Duration) -> Option<Pending> {
    match inbound.try_send(text) {
        Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => None,
        Err(mpsc::error::TrySendError::Full(text)) => Some(Pending {
            text,
            deadline: Instant::now() + bound,
        }),
    }
}

/// Send a close frame and wait (bounded) for the peer's close.
async fn close_handshake(socket: &mut WebSocket, code: u16, reason: &str, grace: Duration) {
    let frame = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    match timeout(grace, socket.send(frame)).await {
        Ok(Ok(())) => {
            let _ = timeout(grace, drain(socket)).await;
        }
        Ok(Err(e)) => tracing::debug!(error = %e, "Close frame could not be sent"),
        Err(_) => tracing::debug!("Close frame send timed out"),
    }
}

/// Read until the peer's close frame or the end of the stream.
async fn drain(socket: &mut WebSocket) {
    while let Some(Ok(message)) = socket.recv().await {
        if matches!(message, Message::Close(_)) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        channel: DuplexChannel,
        in_tx: mpsc::Sender<String>,
        _out_rx: mpsc::Receiver<Outbound>,
        shared: Arc<Shared>,
    }

    fn harness() -> Harness {
        let (out_tx, out_rx) = mpsc::channel(4);
        let (in_tx, in_rx) = mpsc::channel(4);
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            state: AtomicU8::new(ChannelState::Open as u8),
            reason: OnceLock::new(),
            closed,
        });
        let channel = DuplexChannel {
            sender: ChannelSender {
                shared: Arc::clone(&shared),
                outbound: out_tx,
                send_timeout: Duration::from_millis(50),
            },
            inbound: in_rx,
            close_delivered: false,
            path: "/chat".to_string(),
        };
        Harness {
            channel,
            in_tx,
            _out_rx: out_rx,
            shared,
        }
    }

    #[tokio::test]
    async fn close_event_is_delivered_exactly_once() {
        let Harness {
            mut channel,
            in_tx,
            shared,
            ..
        } = harness();
        in_tx.send("hello".to_string()).await.unwrap();
        assert!(shared.finish(CloseReason::Local));
        assert!(!shared.finish(CloseReason::Shutdown));
        drop(in_tx);

        assert_eq!(channel.recv().await, Some(ChannelEvent::Message("hello".into())));
        assert_eq!(channel.recv().await, Some(ChannelEvent::Closed(CloseReason::Local)));
        assert_eq!(channel.recv().await, None);
        assert_eq!(channel.recv().await, None);
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let h = harness();
        h.shared.finish(CloseReason::Local);
        assert!(matches!(h.channel.send("late").await, Err(ChannelError::Closed)));
        assert_eq!(h.channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn send_times_out_on_full_queue() {
        let h = harness();
        for _ in 0..4 {
            h.channel.send("fill").await.unwrap();
        }
        assert!(matches!(h.channel.send("overflow").await, Err(ChannelError::Timeout(_))));
    }

    #[tokio::test]
    async fn closed_waiter_wakes() {
        let h = harness();
        let sender = h.channel.sender();
        let waiter = tokio::spawn(async move { sender.closed().await });
        h.shared.finish(CloseReason::Shutdown);
        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(h.channel.sender().close_reason(), Some(CloseReason::Shutdown));
    }
}
