//! `/health` endpoint.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` while the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live WebSocket connections registered with the hub.
    pub connections: usize,
    /// Sessions held by the registry, connected or not.
    pub sessions: usize,
    /// When the check ran.
    pub timestamp: DateTime<Utc>,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, connections: usize, sessions: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        sessions,
        timestamp: Utc::now(),
    }
}
