//! Connection hub: the registry of live connections and the
//! session → connection index.
//!
//! Mutation (register, unregister, broadcast fan-out) is funneled through a
//! single runner task that consumes [`Command`]s one at a time, so the two
//! maps never diverge. Reads (`client_count`, `session_codes`,
//! `has_session`) and targeted lookups take the read lock directly.

use std::collections::HashMap;
use std::sync::Arc;

use fle_core::code::normalize_session_code;
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_DISCONNECTIONS_TOTAL, WS_DROPPED_MESSAGES_TOTAL, WS_EVICTIONS_TOTAL};

use super::connection::{CloseReason, Connection, Enqueue, Frame};

/// Pending hub commands before callers start waiting on hand-off.
const COMMAND_BUFFER: usize = 64;

/// Hub failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    /// The runner task has stopped.
    #[error("hub is not running")]
    Closed,
}

/// Outcome of [`Hub::send_to_session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The frame was queued for the session's connection.
    Delivered,
    /// No connection is registered for the session; the frame was dropped.
    NoSession,
    /// The connection's queue was full or closed and it has been evicted.
    Evicted,
}

/// Per-broadcast accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections in the snapshot.
    pub recipients: usize,
    /// Connections that accepted the frame.
    pub delivered: usize,
    /// Connections evicted during the fan-out.
    pub evicted: usize,
}

#[derive(Default)]
struct Registry {
    clients: HashMap<String, Arc<Connection>>,
    sessions: HashMap<String, Arc<Connection>>,
}

enum Command {
    Register {
        conn: Arc<Connection>,
        ack: oneshot::Sender<()>,
    },
    Unregister {
        conn: Arc<Connection>,
        ack: oneshot::Sender<bool>,
    },
    Broadcast {
        frame: Frame,
        ack: oneshot::Sender<BroadcastReport>,
    },
}

/// Registry of live connections.
pub struct Hub {
    registry: Arc<RwLock<Registry>>,
    commands: mpsc::Sender<Command>,
    shutdown: CancellationToken,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl Hub {
    /// Start a hub with its own shutdown token.
    pub fn new() -> Self {
        Self::with_shutdown(CancellationToken::new())
    }

    /// Start a hub whose runner stops when `shutdown` is cancelled.
    ///
    /// Stopping the runner does not close live connections; they wind down
    /// on their own and their unregistration is then a no-op.
    pub fn with_shutdown(shutdown: CancellationToken) -> Self {
        let registry = Arc::new(RwLock::new(Registry::default()));
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        let runner = tokio::spawn(run(Arc::clone(&registry), rx, shutdown.clone()));
        Self {
            registry,
            commands,
            shutdown,
            runner: Mutex::new(Some(runner)),
        }
    }

    // ── Mutation (via the runner) ───────────────────────────────────

    /// Add `conn` to both views. A later registration under the same
    /// session code becomes the addressable one.
    pub async fn register_client(&self, conn: Arc<Connection>) -> Result<(), HubError> {
        let (ack, done) = oneshot::channel();
        self.submit(Command::Register { conn, ack }).await?;
        done.await.map_err(|_| HubError::Closed)
    }

    /// Remove `conn` from both views and close its queue.
    ///
    /// Returns whether it was registered.
    pub async fn unregister_client(&self, conn: Arc<Connection>) -> Result<bool, HubError> {
        let (ack, done) = oneshot::channel();
        self.submit(Command::Unregister { conn, ack }).await?;
        done.await.map_err(|_| HubError::Closed)
    }

    /// Enqueue `frame` on every registered connection.
    ///
    /// The fan-out runs against a snapshot; connections whose queue does not
    /// accept the frame are evicted.
    pub async fn broadcast_message(&self, frame: impl Into<Frame>) -> Result<BroadcastReport, HubError> {
        let (ack, done) = oneshot::channel();
        self.submit(Command::Broadcast {
            frame: frame.into(),
            ack,
        })
        .await?;
        done.await.map_err(|_| HubError::Closed)
    }

    async fn submit(&self, command: Command) -> Result<(), HubError> {
        self.commands.send(command).await.map_err(|_| HubError::Closed)
    }

    // ── Targeted delivery ───────────────────────────────────────────

    /// Enqueue `frame` on the session's current connection.
    ///
    /// Unknown sessions drop the frame. A full queue evicts the connection
    /// instead of waiting.
    pub async fn send_to_session(&self, session_code: &str, frame: impl Into<Frame>) -> Result<Delivery, HubError> {
        let code = normalize_session_code(session_code);
        let conn = self.registry.read().sessions.get(&code).cloned();
        let Some(conn) = conn else {
            warn!(session_code = %code, "send to unknown session dropped");
            return Ok(Delivery::NoSession);
        };

        match conn.try_enqueue(frame.into()) {
            Enqueue::Queued => {
                debug!(session_code = %code, connection_id = conn.id(), "frame queued for session");
                Ok(Delivery::Delivered)
            }
            outcome => {
                warn!(
                    session_code = %code,
                    connection_id = conn.id(),
                    ?outcome,
                    "session queue rejected frame, evicting"
                );
                counter!(WS_DROPPED_MESSAGES_TOTAL).increment(1);
                mark_evicted(&conn);
                let _ = self.unregister_client(conn).await?;
                Ok(Delivery::Evicted)
            }
        }
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// Number of registered connections.
    pub fn client_count(&self) -> usize {
        self.registry.read().clients.len()
    }

    /// Sorted snapshot of addressable session codes.
    pub fn session_codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.registry.read().sessions.keys().cloned().collect();
        codes.sort();
        codes
    }

    /// Whether a connection is addressable under `session_code`.
    pub fn has_session(&self, session_code: &str) -> bool {
        self.registry
            .read()
            .sessions
            .contains_key(&normalize_session_code(session_code))
    }

    /// The connection currently addressable under `session_code`.
    pub fn connection_for(&self, session_code: &str) -> Option<Arc<Connection>> {
        self.registry
            .read()
            .sessions
            .get(&normalize_session_code(session_code))
            .cloned()
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Whether the runner task is still accepting commands.
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Stop the runner and wait for it to exit. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let runner = self.runner.lock().take();
        if let Some(runner) = runner {
            let _ = runner.await;
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

// ── Runner ──────────────────────────────────────────────────────────

async fn run(registry: Arc<RwLock<Registry>>, mut commands: mpsc::Receiver<Command>, shutdown: CancellationToken) {
    info!("connection hub started");
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    Command::Register { conn, ack } => {
                        register(&registry, conn);
                        let _ = ack.send(());
                    }
                    Command::Unregister { conn, ack } => {
                        let _ = ack.send(unregister(&registry, &conn));
                    }
                    Command::Broadcast { frame, ack } => {
                        let _ = ack.send(broadcast(&registry, &frame));
                    }
                }
            }
        }
    }
    commands.close();
    info!(clients = registry.read().clients.len(), "connection hub stopped");
}

fn register(registry: &RwLock<Registry>, conn: Arc<Connection>) {
    let mut reg = registry.write();
    let code = conn.session_code().to_string();
    if let Some(previous) = reg.sessions.insert(code.clone(), Arc::clone(&conn)) {
        if previous.id() != conn.id() {
            debug!(session_code = %code, superseded = previous.id(), "session index superseded");
        }
    }
    let _ = reg.clients.insert(conn.id().to_string(), Arc::clone(&conn));
    let count = reg.clients.len();
    drop(reg);

    record_active(count);
    info!(session_code = %code, connection_id = conn.id(), clients = count, "client registered");
}

fn unregister(registry: &RwLock<Registry>, conn: &Arc<Connection>) -> bool {
    let mut reg = registry.write();
    let removed = reg.clients.remove(conn.id()).is_some();
    if removed
        && reg
            .sessions
            .get(conn.session_code())
            .is_some_and(|current| current.id() == conn.id())
    {
        let _ = reg.sessions.remove(conn.session_code());
    }
    let count = reg.clients.len();
    drop(reg);

    let _ = conn.close_queue();
    if removed {
        record_active(count);
        counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
        info!(
            session_code = conn.session_code(),
            connection_id = conn.id(),
            clients = count,
            "client unregistered"
        );
    }
    removed
}

fn broadcast(registry: &RwLock<Registry>, frame: &Frame) -> BroadcastReport {
    let snapshot: Vec<Arc<Connection>> = registry.read().clients.values().cloned().collect();
    let mut report = BroadcastReport {
        recipients: snapshot.len(),
        ..BroadcastReport::default()
    };
    debug!(recipients = report.recipients, bytes = frame.len(), "broadcasting frame");

    for conn in snapshot {
        if conn.try_enqueue(Arc::clone(frame)) == Enqueue::Queued {
            report.delivered += 1;
            continue;
        }
        warn!(
            session_code = conn.session_code(),
            connection_id = conn.id(),
            "queue rejected broadcast, evicting"
        );
        counter!(WS_DROPPED_MESSAGES_TOTAL).increment(1);
        mark_evicted(&conn);
        let _ = unregister(registry, &conn);
        report.evicted += 1;
    }
    report
}

fn mark_evicted(conn: &Connection) {
    conn.begin_close(CloseReason::Evicted);
    if conn.close_queue() {
        counter!(WS_EVICTIONS_TOTAL).increment(1);
    }
}

#[allow(clippy::cast_precision_loss)]
fn record_active(count: usize) {
    gauge!(WS_CONNECTIONS_ACTIVE).set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    use crate::websocket::connection::ConnectionState;

    fn conn(code: &str, capacity: usize) -> (Arc<Connection>, mpsc::Receiver<Frame>) {
        Connection::new(code, capacity)
    }

    #[tokio::test]
    async fn register_populates_both_views() {
        let hub = Hub::new();
        let (c, _rx) = conn("happy-panda-42", 4);
        hub.register_client(Arc::clone(&c)).await.unwrap();

        assert_eq!(hub.client_count(), 1);
        assert!(hub.has_session("happy-panda-42"));
        assert!(hub.has_session("HAPPY-PANDA-42"));
        assert_eq!(hub.session_codes(), vec!["happy-panda-42".to_string()]);
    }

    #[tokio::test]
    async fn uppercase_registration_is_reachable() {
        let hub = Hub::new();
        let (c, mut rx) = conn("HAPPY-PANDA-42", 4);
        hub.register_client(Arc::clone(&c)).await.unwrap();

        assert!(hub.has_session("HAPPY-PANDA-42"));
        assert!(hub.has_session("happy-panda-42"));
        assert_eq!(hub.session_codes(), vec!["happy-panda-42".to_string()]);
        assert_eq!(hub.connection_for("Happy-Panda-42").unwrap().id(), c.id());
        assert_eq!(hub.send_to_session("HAPPY-PANDA-42", "hi").await.unwrap(), Delivery::Delivered);
        assert_eq!(&*rx.try_recv().unwrap(), "hi");

        assert!(hub.unregister_client(c).await.unwrap());
        assert!(!hub.has_session("happy-panda-42"));
    }

    #[tokio::test]
    async fn unregister_clears_both_views_and_closes_queue() {
        let hub = Hub::new();
        let (c, mut rx) = conn("a-b-1", 4);
        hub.register_client(Arc::clone(&c)).await.unwrap();

        assert!(hub.unregister_client(Arc::clone(&c)).await.unwrap());
        assert_eq!(hub.client_count(), 0);
        assert!(!hub.has_session("a-b-1"));
        assert!(c.is_queue_closed());
        assert!(rx.recv().await.is_none());

        // Second unregister is a no-op.
        assert!(!hub.unregister_client(c).await.unwrap());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_queue() {
        let hub = Hub::new();
        let mut receivers = Vec::new();
        for i in 1..=5 {
            let (c, rx) = conn(&format!("calm-otter-{i}"), 4);
            hub.register_client(c).await.unwrap();
            receivers.push(rx);
        }

        let report = hub.broadcast_message("m").await.unwrap();
        assert_eq!(report, BroadcastReport { recipients: 5, delivered: 5, evicted: 0 });
        for rx in &mut receivers {
            assert_eq!(&*rx.try_recv().unwrap(), "m");
        }
    }

    #[tokio::test]
    async fn send_to_session_targets_one_connection() {
        let hub = Hub::new();
        let (a, mut rx_a) = conn("a-b-1", 4);
        let (b, mut rx_b) = conn("c-d-2", 4);
        hub.register_client(a).await.unwrap();
        hub.register_client(b).await.unwrap();

        assert_eq!(hub.send_to_session("C-D-2", "hi").await.unwrap(), Delivery::Delivered);
        assert_eq!(&*rx_b.try_recv().unwrap(), "hi");
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_session_is_dropped() {
        let hub = Hub::new();
        assert_eq!(hub.send_to_session("nobody-here-7", "x").await.unwrap(), Delivery::NoSession);
    }

    #[tokio::test]
    async fn saturated_queue_evicts_on_send() {
        let hub = Hub::new();
        let (c, _rx) = conn("slow-sloth-3", 2);
        hub.register_client(Arc::clone(&c)).await.unwrap();

        for _ in 0..2 {
            assert_eq!(hub.send_to_session("slow-sloth-3", "fill").await.unwrap(), Delivery::Delivered);
        }
        assert_eq!(hub.send_to_session("slow-sloth-3", "over").await.unwrap(), Delivery::Evicted);

        assert!(!hub.has_session("slow-sloth-3"));
        assert_eq!(hub.client_count(), 0);
        assert!(c.is_queue_closed());
        assert_eq!(c.close_reason(), Some(CloseReason::Evicted));
    }

    #[tokio::test]
    async fn saturated_queue_evicts_on_broadcast() {
        let hub = Hub::new();
        let (slow, _slow_rx) = conn("slow-sloth-3", 1);
        let (fast, mut fast_rx) = conn("fast-fox-4", 8);
        hub.register_client(Arc::clone(&slow)).await.unwrap();
        hub.register_client(fast).await.unwrap();

        let first = hub.broadcast_message("1").await.unwrap();
        assert_eq!(first.delivered, 2);
        let second = hub.broadcast_message("2").await.unwrap();
        assert_eq!(second, BroadcastReport { recipients: 2, delivered: 1, evicted: 1 });

        assert!(!hub.has_session("slow-sloth-3"));
        assert!(hub.has_session("fast-fox-4"));
        assert_eq!(&*fast_rx.try_recv().unwrap(), "1");
        assert_eq!(&*fast_rx.try_recv().unwrap(), "2");
    }

    #[tokio::test]
    async fn later_registration_supersedes_index() {
        let hub = Hub::new();
        let (old, mut old_rx) = conn("twin-star-9", 4);
        let (new, mut new_rx) = conn("twin-star-9", 4);
        hub.register_client(Arc::clone(&old)).await.unwrap();
        hub.register_client(Arc::clone(&new)).await.unwrap();

        assert_eq!(hub.client_count(), 2);
        assert_eq!(hub.connection_for("twin-star-9").unwrap().id(), new.id());

        // The superseded connection is not closed by the supersede itself.
        assert!(!old.is_queue_closed());

        // Unregistering the old one leaves the index pointing at the new one.
        assert!(hub.unregister_client(Arc::clone(&old)).await.unwrap());
        assert!(hub.has_session("twin-star-9"));
        assert_eq!(hub.send_to_session("twin-star-9", "x").await.unwrap(), Delivery::Delivered);
        assert_eq!(&*new_rx.try_recv().unwrap(), "x");
        assert!(old_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn eviction_of_closed_queue() {
        let hub = Hub::new();
        let (c, rx) = conn("gone-away-5", 4);
        hub.register_client(Arc::clone(&c)).await.unwrap();
        drop(rx);

        let report = hub.broadcast_message("x").await.unwrap();
        assert_eq!(report.evicted, 1);
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_runner() {
        let hub = Hub::new();
        let (c, _rx) = conn("a-b-1", 4);
        hub.register_client(Arc::clone(&c)).await.unwrap();

        hub.shutdown().await;
        hub.shutdown().await;
        assert!(!hub.is_running());

        // Live connections are left alone.
        assert!(!c.is_queue_closed());
        assert_eq!(c.state(), ConnectionState::Connecting);

        let (late, _late_rx) = conn("c-d-2", 4);
        assert_matches!(hub.register_client(late).await, Err(HubError::Closed));
        assert_matches!(hub.broadcast_message("x").await, Err(HubError::Closed));
        // Reads still work.
        assert_eq!(hub.client_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_registrations_stay_consistent() {
        let hub = Arc::new(Hub::new());
        let mut handles = Vec::new();
        for i in 0..50 {
            let hub = Arc::clone(&hub);
            handles.push(tokio::spawn(async move {
                let (c, rx) = Connection::new(format!("busy-bee-{}", i % 25 + 1), 4);
                hub.register_client(Arc::clone(&c)).await.unwrap();
                if i % 2 == 0 {
                    let _ = hub.unregister_client(c).await.unwrap();
                }
                rx
            }));
        }
        let mut receivers = Vec::new();
        for h in handles {
            receivers.push(h.await.unwrap());
        }

        assert_eq!(hub.client_count(), 25);
        let indexed = hub.session_codes();
        for code in &indexed {
            let conn = hub.connection_for(code).unwrap();
            assert_eq!(conn.session_code(), code);
            assert!(!conn.is_queue_closed());
        }
    }
}
