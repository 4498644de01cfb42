//! WebSocket connection management: per-socket state, the hub, heartbeat
//! timing, and the reader/writer lifecycle.

pub mod connection;
pub mod heartbeat;
pub mod hub;
pub mod lifecycle;

pub use connection::{CloseReason, Connection, ConnectionState, Enqueue, Frame};
pub use hub::{BroadcastReport, Delivery, Hub, HubError};
pub use lifecycle::{ConnectionConfig, run_connection, serve_socket, welcome_frame};
