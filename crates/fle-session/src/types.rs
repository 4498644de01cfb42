//! Session data model and errors.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// A live session.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Normalized session code (natural key).
    pub code: String,
    /// When the session was minted.
    pub created_at: DateTime<Utc>,
    /// Bumped on every successful lookup or data update.
    pub last_accessed: DateTime<Utc>,
    /// Arbitrary per-session values.
    pub data: HashMap<String, Value>,
}

impl Session {
    /// Whether the session has been idle longer than `timeout` at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        let timeout = chrono::TimeDelta::from_std(timeout).unwrap_or(chrono::TimeDelta::MAX);
        now.signed_duration_since(self.last_accessed) > timeout
    }
}

/// Session creation and expiry options.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Extra generation attempts after a collision.
    pub max_retries: u32,
    /// Idle time after which a session expires.
    pub timeout: Duration,
    /// Values copied into every new session.
    pub initial_data: HashMap<String, Value>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_retries: 10,
            timeout: Duration::from_secs(24 * 60 * 60),
            initial_data: HashMap::new(),
        }
    }
}

// ── Error code constants ────────────────────────────────────────────

/// Session does not exist.
pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
/// Session existed but outlived its idle timeout.
pub const SESSION_EXPIRED: &str = "SESSION_EXPIRED";
/// Code is not `adjective-noun-number`.
pub const INVALID_SESSION_CODE: &str = "INVALID_SESSION_CODE";
/// Every generation attempt collided.
pub const CODE_GENERATION_FAILED: &str = "CODE_GENERATION_FAILED";
/// Creation was cancelled between attempts.
pub const CANCELLED: &str = "CANCELLED";

/// Session registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No session is stored under the code.
    #[error("session not found")]
    NotFound,
    /// The session was idle too long and has been removed.
    #[error("session has expired")]
    Expired,
    /// The code is malformed.
    #[error("invalid session code format")]
    InvalidCode,
    /// No unique code was found within the retry budget.
    #[error("failed to generate unique session code after {attempts} attempts")]
    CodeGenerationFailed {
        /// Attempts made, including the first.
        attempts: u32,
    },
    /// The caller's cancellation token fired between attempts.
    #[error("session creation cancelled")]
    Cancelled,
}

impl SessionError {
    /// Machine-readable error code for this variant.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => SESSION_NOT_FOUND,
            Self::Expired => SESSION_EXPIRED,
            Self::InvalidCode => INVALID_SESSION_CODE,
            Self::CodeGenerationFailed { .. } => CODE_GENERATION_FAILED,
            Self::Cancelled => CANCELLED,
        }
    }
}
