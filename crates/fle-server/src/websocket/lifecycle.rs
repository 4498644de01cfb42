//! Per-connection lifecycle: registration, the reader and writer pumps, and
//! teardown.
//!
//! The reader owns the inbound half and dispatches frames through the RPC
//! router one at a time. The writer owns the outbound half, drains the
//! bounded queue with batching, and pings on a fixed period. Both run inside
//! a panic boundary. Whichever stops first ends the connection; every exit
//! path converges on hub unregistration and socket close.

use std::fmt::Display;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use fle_core::panic::panic_message;
use fle_rpc::{Notification, Router, RpcContext};
use fle_settings::types::WebSocketSettings;
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, histogram};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, error, info, instrument, warn};

use crate::metrics::{WS_CONNECTIONS_TOTAL, WS_CONNECTION_DURATION_SECONDS, WS_DROPPED_MESSAGES_TOTAL};

use super::connection::{CloseReason, Connection, Frame};
use super::heartbeat::{ReadDeadline, ping_ticker};
use super::hub::Hub;

/// Text carried by the welcome notification.
pub const WELCOME_MESSAGE: &str = "WebSocket connection established successfully";

/// Transport limits and timers for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Largest inbound frame, in bytes.
    pub max_message_size: usize,
    /// Outbound queue capacity, in frames.
    pub send_queue_capacity: usize,
    /// Writer ping period. Must be shorter than `pong_wait`.
    pub heartbeat_interval: Duration,
    /// Read deadline, renewed by each liveness frame.
    pub pong_wait: Duration,
    /// Bound on each socket write.
    pub write_wait: Duration,
}

impl ConnectionConfig {
    /// Build from the `websocket` settings section.
    pub fn from_settings(settings: &WebSocketSettings) -> Self {
        Self {
            max_message_size: settings.max_message_size,
            send_queue_capacity: settings.send_queue_capacity,
            heartbeat_interval: settings.heartbeat_interval(),
            pong_wait: settings.pong_wait(),
            write_wait: settings.write_wait(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from_settings(&WebSocketSettings::default())
    }
}

/// How the writer stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
enum WriterExit {
    QueueClosed,
    WriteFailed(String),
    Panicked(String),
}

/// Serialized `welcome` notification for `session_code`.
pub fn welcome_frame(session_code: &str) -> Option<Frame> {
    let notification = Notification::new(
        "welcome",
        json!({
            "sessionCode": session_code,
            "message": WELCOME_MESSAGE,
            "timestamp": Utc::now().to_rfc3339(),
        }),
    );
    match serde_json::to_string(&notification) {
        Ok(text) => Some(Frame::from(text)),
        Err(err) => {
            error!(session_code, error = %err, "failed to encode welcome");
            None
        }
    }
}

/// Run an upgraded axum socket to completion.
pub async fn serve_socket(
    socket: WebSocket,
    session_code: String,
    hub: Arc<Hub>,
    router: Arc<Router>,
    config: ConnectionConfig,
) {
    let (sink, stream) = socket.split();
    let _ = run_connection(sink, stream, session_code, hub, router, config).await;
}

/// Register a connection for `session_code`, pump frames until either side
/// stops, then unregister. Returns why the connection closed.
#[instrument(skip_all, fields(session_code = %session_code))]
pub async fn run_connection<Si, St, E>(
    sink: Si,
    stream: St,
    session_code: String,
    hub: Arc<Hub>,
    router: Arc<Router>,
    config: ConnectionConfig,
) -> CloseReason
where
    Si: Sink<Message> + Unpin + Send + 'static,
    Si::Error: Display,
    St: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: Display + Send,
{
    let (conn, rx) = Connection::new(session_code, config.send_queue_capacity);

    if let Err(err) = hub.register_client(Arc::clone(&conn)).await {
        warn!(connection_id = conn.id(), error = %err, "hub rejected connection");
        let _ = conn.close_queue();
        conn.mark_closed();
        return CloseReason::Error(err.to_string());
    }
    conn.mark_open();
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    info!(connection_id = conn.id(), "client connected");

    if let Some(welcome) = welcome_frame(conn.session_code()) {
        if !conn.send(welcome) {
            warn!(connection_id = conn.id(), "welcome dropped");
        }
    }

    let mut writer = tokio::spawn(writer_task(sink, rx, Arc::clone(&conn), config));
    let mut writer_done = false;

    let reason = tokio::select! {
        reason = reader_task(stream, &conn, &router, &config) => reason,
        exit = &mut writer => {
            writer_done = true;
            match exit {
                Ok(WriterExit::QueueClosed) => CloseReason::Graceful,
                Ok(WriterExit::WriteFailed(detail)) => CloseReason::Error(detail),
                Ok(WriterExit::Panicked(detail)) => CloseReason::Error(format!("writer panic: {detail}")),
                Err(join) => CloseReason::Error(format!("writer task failed: {join}")),
            }
        }
    };

    conn.begin_close(reason);
    let reason = conn.close_reason().unwrap_or(CloseReason::Graceful);

    if let Err(err) = hub.unregister_client(Arc::clone(&conn)).await {
        debug!(connection_id = conn.id(), error = %err, "hub gone, closing queue directly");
        let _ = conn.close_queue();
    }

    if !writer_done && time::timeout(config.write_wait, &mut writer).await.is_err() {
        warn!(connection_id = conn.id(), "writer did not stop in time, aborting");
        writer.abort();
    }

    conn.mark_closed();
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(conn.age().as_secs_f64());
    match &reason {
        CloseReason::Error(detail) => {
            warn!(
                connection_id = conn.id(),
                reason = %detail,
                since_pong_secs = conn.last_pong_elapsed().as_secs(),
                "client disconnected with error"
            );
        }
        other => info!(
            connection_id = conn.id(),
            reason = %other,
            age_secs = conn.age().as_secs(),
            "client disconnected"
        ),
    }
    reason
}

// ── Reader ──────────────────────────────────────────────────────────

async fn reader_task<St, E>(stream: St, conn: &Connection, router: &Router, config: &ConnectionConfig) -> CloseReason
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    match AssertUnwindSafe(read_pump(stream, conn, router, config))
        .catch_unwind()
        .await
    {
        Ok(reason) => reason,
        Err(panic) => {
            let detail = panic_message(panic.as_ref());
            error!(connection_id = conn.id(), panic = %detail, "reader panicked");
            CloseReason::Error(format!("reader panic: {detail}"))
        }
    }
}

async fn read_pump<St, E>(mut stream: St, conn: &Connection, router: &Router, config: &ConnectionConfig) -> CloseReason
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let ctx = RpcContext::new(conn.session_code(), conn.id());
    let mut deadline = ReadDeadline::new(config.pong_wait);

    loop {
        let Ok(next) = time::timeout_at(deadline.deadline(), stream.next()).await else {
            return CloseReason::Error("read deadline exceeded".into());
        };
        let message = match next {
            None => return CloseReason::Graceful,
            Some(Err(err)) => return CloseReason::Error(err.to_string()),
            Some(Ok(message)) => message,
        };

        let payload: Bytes = match message {
            Message::Text(text) => Bytes::copy_from_slice(text.as_str().as_bytes()),
            Message::Binary(data) => data,
            Message::Ping(_) | Message::Pong(_) => {
                conn.mark_alive();
                deadline.renew();
                continue;
            }
            Message::Close(_) => {
                debug!(connection_id = conn.id(), "client sent close frame");
                return CloseReason::Graceful;
            }
        };

        if payload.len() > config.max_message_size {
            return CloseReason::Error(format!(
                "frame of {} bytes exceeds limit of {}",
                payload.len(),
                config.max_message_size
            ));
        }

        dispatch(&payload, conn, router, &ctx).await;
    }
}

/// Route one inbound frame and enqueue the response, if any.
async fn dispatch(payload: &[u8], conn: &Connection, router: &Router, ctx: &RpcContext) {
    debug!(connection_id = conn.id(), bytes = payload.len(), "frame received");
    let Some(response) = router.route_bytes(payload, ctx).await else {
        return;
    };
    let frame = match String::from_utf8(response) {
        Ok(text) => Frame::from(text),
        Err(err) => {
            error!(connection_id = conn.id(), error = %err, "response was not UTF-8");
            return;
        }
    };
    if !conn.send(frame) {
        counter!(WS_DROPPED_MESSAGES_TOTAL).increment(1);
        warn!(
            session_code = conn.session_code(),
            connection_id = conn.id(),
            "outbound queue full, response dropped"
        );
    }
}

// ── Writer ──────────────────────────────────────────────────────────

async fn writer_task<Si>(mut sink: Si, mut rx: mpsc::Receiver<Frame>, conn: Arc<Connection>, config: ConnectionConfig) -> WriterExit
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    let exit = AssertUnwindSafe(write_pump(&mut sink, &mut rx, &conn, &config))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            let detail = panic_message(panic.as_ref());
            error!(connection_id = conn.id(), panic = %detail, "writer panicked");
            WriterExit::Panicked(detail)
        });
    if !matches!(exit, WriterExit::Panicked(_)) {
        let _ = time::timeout(config.write_wait, sink.close()).await;
    }
    exit
}

async fn write_pump<Si>(
    sink: &mut Si,
    rx: &mut mpsc::Receiver<Frame>,
    conn: &Connection,
    config: &ConnectionConfig,
) -> WriterExit
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    let mut ticker = ping_ticker(config.heartbeat_interval);

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(first) = frame else {
                    debug!(connection_id = conn.id(), "outbound queue closed, sending close frame");
                    let _ = send_frame(sink, Message::Close(None), config.write_wait).await;
                    return WriterExit::QueueClosed;
                };
                let (text, batched) = drain_batch(&first, rx);
                if let Err(detail) = send_frame(sink, Message::Text(text.into()), config.write_wait).await {
                    return WriterExit::WriteFailed(detail);
                }
                debug!(connection_id = conn.id(), batched, "frames written");
            }
            _ = ticker.tick() => {
                if let Err(detail) = send_frame(sink, Message::Ping(Bytes::new()), config.write_wait).await {
                    return WriterExit::WriteFailed(detail);
                }
                debug!(connection_id = conn.id(), "ping sent");
            }
        }
    }
}

/// Join `first` with the frames already queued behind it, newline separated.
fn drain_batch(first: &str, rx: &mut mpsc::Receiver<Frame>) -> (String, usize) {
    let pending = rx.len();
    let mut text = String::from(first);
    let mut batched = 0;
    for _ in 0..pending {
        let Ok(next) = rx.try_recv() else { break };
        text.push('\n');
        text.push_str(&next);
        batched += 1;
    }
    (text, batched)
}

async fn send_frame<Si>(sink: &mut Si, message: Message, write_wait: Duration) -> Result<(), String>
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    match time::timeout(write_wait, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err(format!("write timed out after {write_wait:?}")),
    }
}
