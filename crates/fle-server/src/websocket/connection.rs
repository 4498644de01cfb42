//! Per-socket connection state and its bounded outbound queue.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use fle_core::code::normalize_session_code;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Outbound frame text, shared between broadcast recipients.
pub type Frame = Arc<str>;

/// Outcome of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    /// The frame is waiting for the writer.
    Queued,
    /// The queue is at capacity; the frame was not accepted.
    Full,
    /// The queue has been closed; the frame was not accepted.
    Closed,
}

/// Why a connection left the `Open` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer sent a close frame or the stream ended cleanly.
    Graceful,
    /// Transport failure, read deadline expiry, oversize frame, or a fault.
    Error(String),
    /// The hub shed the connection because its queue was full.
    Evicted,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graceful => f.write_str("graceful"),
            Self::Error(detail) => write!(f, "error: {detail}"),
            Self::Evicted => f.write_str("evicted"),
        }
    }
}

/// Connection lifecycle.
///
/// `Connecting → Open → Closing(reason) → Closed`. Every closing path ends
/// in hub unregistration and socket close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted but not yet registered with the hub.
    Connecting,
    /// Registered and pumping frames.
    Open,
    /// Tearing down.
    Closing(CloseReason),
    /// Unregistered and socket released.
    Closed,
}

/// One live socket bound to a session code.
pub struct Connection {
    id: String,
    session_code: String,
    tx: Mutex<Option<mpsc::Sender<Frame>>>,
    queue_closed: AtomicBool,
    state: Mutex<ConnectionState>,
    connected_at: Instant,
    last_pong: Mutex<Instant>,
    dropped_messages: AtomicU64,
}

impl Connection {
    /// Create a connection with an outbound queue of `capacity` frames.
    ///
    /// The receiver belongs to the writer task.
    pub fn new(session_code: impl AsRef<str>, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        Self::with_id(format!("conn_{}", Uuid::now_v7()), session_code, capacity)
    }

    /// Same as [`Connection::new`] with a caller-chosen id.
    ///
    /// The session code is stored normalized.
    pub fn with_id(
        id: impl Into<String>,
        session_code: impl AsRef<str>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let now = Instant::now();
        let conn = Self {
            id: id.into(),
            session_code: normalize_session_code(session_code.as_ref()),
            tx: Mutex::new(Some(tx)),
            queue_closed: AtomicBool::new(false),
            state: Mutex::new(ConnectionState::Connecting),
            connected_at: now,
            last_pong: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        };
        (Arc::new(conn), rx)
    }

    /// Hub-unique connection id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Session code this connection is bound to.
    pub fn session_code(&self) -> &str {
        &self.session_code
    }

    // ── Outbound queue ──────────────────────────────────────────────

    /// Try to enqueue `frame` without waiting.
    pub fn try_enqueue(&self, frame: Frame) -> Enqueue {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Enqueue::Closed;
        };
        match tx.try_send(frame) {
            Ok(()) => Enqueue::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Enqueue::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Enqueue::Closed,
        }
    }

    /// Enqueue `frame`, counting it as dropped when not accepted.
    pub fn send(&self, frame: Frame) -> bool {
        if self.try_enqueue(frame) == Enqueue::Queued {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Close the outbound queue.
    ///
    /// Returns `true` only for the call that actually closed it. Frames
    /// already queued are still delivered before the writer sees the close.
    pub fn close_queue(&self) -> bool {
        if self.queue_closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        drop(self.tx.lock().take());
        true
    }

    /// Whether the outbound queue has been closed.
    pub fn is_queue_closed(&self) -> bool {
        self.queue_closed.load(Ordering::Acquire)
    }

    /// Frames dropped because the queue was full or closed.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state.lock().clone()
    }

    /// Move from `Connecting` to `Open`.
    pub fn mark_open(&self) {
        let mut state = self.state.lock();
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Open;
        }
    }

    /// Enter `Closing`. The first reason wins.
    pub fn begin_close(&self, reason: CloseReason) {
        let mut state = self.state.lock();
        if matches!(*state, ConnectionState::Connecting | ConnectionState::Open) {
            *state = ConnectionState::Closing(reason);
        }
    }

    /// Enter `Closed`.
    pub fn mark_closed(&self) {
        *self.state.lock() = ConnectionState::Closed;
    }

    /// The reason recorded when closing began, if any.
    pub fn close_reason(&self) -> Option<CloseReason> {
        match &*self.state.lock() {
            ConnectionState::Closing(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    // ── Liveness ────────────────────────────────────────────────────

    /// Record a liveness frame from the peer.
    pub fn mark_alive(&self) {
        *self.last_pong.lock() = Instant::now();
    }

    /// Time since the last liveness frame, or since connecting.
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("session_code", &self.session_code)
            .field("queue_closed", &self.is_queue_closed())
            .finish_non_exhaustive()
    }
}
