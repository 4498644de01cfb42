//! Per-call context handed to method handlers.

/// Identity of the connection a call arrived on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RpcContext {
    /// Session code bound to the connection.
    pub session_code: String,
    /// Hub-assigned connection identifier.
    pub connection_id: String,
}

impl RpcContext {
    /// Context for a call on `connection_id` bound to `session_code`.
    pub fn new(session_code: impl Into<String>, connection_id: impl Into<String>) -> Self {
        Self {
            session_code: session_code.into(),
            connection_id: connection_id.into(),
        }
    }
}
