//! JSON-RPC error codes and error type.

use serde_json::Value;

use crate::types::ErrorObject;

// ── Error code constants ────────────────────────────────────────────

/// Invalid JSON was received.
pub const PARSE_ERROR: i32 = -32700;
/// The JSON sent is not a valid request object.
pub const INVALID_REQUEST: i32 = -32600;
/// The method does not exist.
pub const METHOD_NOT_FOUND: i32 = -32601;
/// Invalid method parameters.
pub const INVALID_PARAMS: i32 = -32602;
/// Internal JSON-RPC error.
pub const INTERNAL_ERROR: i32 = -32603;

/// Lowest code of the reserved range.
pub const RESERVED_MIN: i32 = -32768;
/// Highest code of the reserved range.
pub const RESERVED_MAX: i32 = -32000;
/// Lowest implementation-defined server error code.
pub const SERVER_ERROR_MIN: i32 = -32099;
/// Highest implementation-defined server error code.
pub const SERVER_ERROR_MAX: i32 = -32000;

/// Whether `code` falls in the protocol-reserved range.
pub fn is_reserved_code(code: i32) -> bool {
    (RESERVED_MIN..=RESERVED_MAX).contains(&code)
}

/// Whether `code` falls in the implementation-defined server error range.
pub fn is_server_code(code: i32) -> bool {
    (SERVER_ERROR_MIN..=SERVER_ERROR_MAX).contains(&code)
}

/// Canonical message for a standard code.
pub fn standard_message(code: i32) -> Option<&'static str> {
    match code {
        PARSE_ERROR => Some("Parse error"),
        INVALID_REQUEST => Some("Invalid Request"),
        METHOD_NOT_FOUND => Some("Method not found"),
        INVALID_PARAMS => Some("Invalid params"),
        INTERNAL_ERROR => Some("Internal error"),
        _ => None,
    }
}

/// Error returned by handlers and produced by the dispatch pipeline.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    /// Input was not JSON.
    #[error("Parse error")]
    ParseError,

    /// Envelope violates the protocol.
    #[error("{message}")]
    InvalidRequest {
        /// Description.
        message: String,
        /// Structured detail, usually a validation error.
        data: Option<Value>,
    },

    /// No handler is registered under the name.
    #[error("Method not found")]
    MethodNotFound {
        /// The requested method.
        method: String,
    },

    /// Parameters failed validation or could not be interpreted.
    #[error("{message}")]
    InvalidParams {
        /// Description.
        message: String,
        /// Structured detail.
        data: Option<Value>,
    },

    /// Handler fault, timeout, or result validation failure.
    #[error("Internal error")]
    Internal {
        /// Diagnostic detail.
        data: Option<Value>,
    },

    /// Application-defined error with its own code.
    #[error("{message}")]
    Custom {
        /// Integer code, ideally outside the reserved range or inside the server range.
        code: i32,
        /// Human-readable message.
        message: String,
        /// Optional structured detail.
        data: Option<Value>,
    },
}

impl RpcError {
    /// Parameter error without structured data.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
            data: None,
        }
    }

    /// Internal error carrying a diagnostic string.
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal {
            data: Some(Value::String(detail.into())),
        }
    }

    /// Integer code for this variant.
    pub fn code(&self) -> i32 {
        match self {
            Self::ParseError => PARSE_ERROR,
            Self::InvalidRequest { .. } => INVALID_REQUEST,
            Self::MethodNotFound { .. } => METHOD_NOT_FOUND,
            Self::InvalidParams { .. } => INVALID_PARAMS,
            Self::Internal { .. } => INTERNAL_ERROR,
            Self::Custom { code, .. } => *code,
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ParseError => "parse_error",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::MethodNotFound { .. } => "method_not_found",
            Self::InvalidParams { .. } => "invalid_params",
            Self::Internal { .. } => "internal_error",
            Self::Custom { .. } => "custom",
        }
    }

    /// Convert to the wire-format error object.
    pub fn to_error_object(&self) -> ErrorObject {
        let data = match self {
            Self::ParseError | Self::MethodNotFound { .. } => None,
            Self::InvalidRequest { data, .. }
            | Self::InvalidParams { data, .. }
            | Self::Internal { data }
            | Self::Custom { data, .. } => data.clone(),
        };
        ErrorObject {
            code: self.code(),
            message: self.to_string(),
            data,
        }
    }
}
