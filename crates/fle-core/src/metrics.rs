//! Metric names recorded across the workspace.
//!
//! Libraries record through the `metrics` facade; the binary installs the
//! Prometheus recorder that renders them.

/// RPC requests total (counter, labels: method).
pub const RPC_REQUESTS_TOTAL: &str = "rpc_requests_total";
/// RPC errors total (counter, labels: method, error_type).
pub const RPC_ERRORS_TOTAL: &str = "rpc_errors_total";
/// RPC request duration seconds (histogram, labels: method).
pub const RPC_REQUEST_DURATION_SECONDS: &str = "rpc_request_duration_seconds";
/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Connections registered with the hub (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Connection lifetime seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Connections shed for a full outbound queue (counter).
pub const WS_EVICTIONS_TOTAL: &str = "ws_evictions_total";
/// Outbound frames not accepted by a queue (counter).
pub const WS_DROPPED_MESSAGES_TOTAL: &str = "ws_dropped_messages_total";
/// Sessions minted (counter).
pub const SESSIONS_CREATED_TOTAL: &str = "sessions_created_total";
/// Sessions removed after idling past the timeout (counter).
pub const SESSIONS_EXPIRED_TOTAL: &str = "sessions_expired_total";

/// Every metric name above.
pub const ALL: [&str; 11] = [
    RPC_REQUESTS_TOTAL,
    RPC_ERRORS_TOTAL,
    RPC_REQUEST_DURATION_SECONDS,
    WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
    WS_CONNECTIONS_ACTIVE,
    WS_CONNECTION_DURATION_SECONDS,
    WS_EVICTIONS_TOTAL,
    WS_DROPPED_MESSAGES_TOTAL,
    SESSIONS_CREATED_TOTAL,
    SESSIONS_EXPIRED_TOTAL,
];
