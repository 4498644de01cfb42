//! # fle-server
//!
//! Axum HTTP + `WebSocket` server for FLE sessions.
//!
//! - HTTP endpoints: `/health`, `/metrics` (Prometheus), `/ws` upgrade
//! - [`websocket`]: per-connection reader/writer pumps, heartbeat, and the
//!   connection hub that routes frames by session code
//! - [`methods`]: built-in `ping`, `echo`, `getSessionInfo`
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod health;
pub mod methods;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use server::{AppState, FleServer, ServerError};
pub use shutdown::{DrainReport, ShutdownCoordinator};
