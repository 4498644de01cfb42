//! # fle-rpc
//!
//! JSON-RPC 2.0 over text frames.
//!
//! - [`types`]: wire envelope (`Request`, `Response`, `ErrorObject`, `Notification`)
//! - [`errors`]: standard error codes and the [`RpcError`] taxonomy
//! - [`validation`]: fast-fail, tag-driven validation of JSON values
//! - [`router`]: method registry and the dispatch pipeline
//!
//! The router never surfaces anything for notifications and turns handler
//! panics into `InternalError` responses, so nothing below a connection can
//! take the process down.

#![deny(unsafe_code)]

pub mod context;
pub mod errors;
pub mod router;
pub mod types;
pub mod validation;

pub use context::RpcContext;
pub use errors::RpcError;
pub use router::{MethodHandler, MethodInfo, MethodOptions, Router, RouterError, handler_fn};
pub use types::{ErrorObject, JSONRPC_VERSION, Notification, Request, Response};
pub use validation::{Rule, Schema, SchemaError, ValidationError, Validator};
