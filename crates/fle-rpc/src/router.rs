//! Method registry and the dispatch pipeline.
//!
//! [`Router::route`] runs, in order:
//! 1. envelope validation (`InvalidRequest`)
//! 2. notification classification (no `id`)
//! 3. method lookup (`MethodNotFound`)
//! 4. params schema (`InvalidParams`)
//! 5. handler call inside a panic boundary and a timeout (`InternalError`)
//! 6. result schema (`InternalError`)
//! 7. response construction, skipped for notifications

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use metrics::{counter, histogram};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use fle_core::metrics::{RPC_ERRORS_TOTAL, RPC_REQUESTS_TOTAL, RPC_REQUEST_DURATION_SECONDS};
use fle_core::panic::panic_message;

use crate::context::RpcContext;
use crate::errors::RpcError;
use crate::types::{Request, Response};
use crate::validation::{Schema, ValidationError, Validator};

/// Maximum time a single handler is allowed to run.
pub const HANDLER_TIMEOUT: Duration = Duration::from_secs(60);

/// Serialized fallback when a response cannot be encoded.
const ENCODE_FAILURE: &str =
    r#"{"jsonrpc":"2.0","error":{"code":-32603,"message":"Internal error"},"id":null}"#;

/// Trait implemented by every RPC method handler.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Execute the handler with the given params and context.
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError>;
}

/// Adapter turning an async closure into a [`MethodHandler`].
pub struct FnHandler<F>(F);

/// Wrap `f` as a handler. The closure receives an owned context clone.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Option<Value>, RpcContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RpcError>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> MethodHandler for FnHandler<F>
where
    F: Fn(Option<Value>, RpcContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RpcError>> + Send,
{
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        (self.0)(params, ctx.clone()).await
    }
}

/// Optional registration metadata.
#[derive(Clone, Debug, Default)]
pub struct MethodOptions {
    /// Schema applied to `params` before the handler runs.
    pub params_schema: Option<Schema>,
    /// Schema applied to a non-null result.
    pub result_schema: Option<Schema>,
    /// Free-form description.
    pub description: String,
}

impl MethodOptions {
    /// Options with only a description.
    pub fn described(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    /// Attach a params schema.
    #[must_use]
    pub fn with_params(mut self, schema: Schema) -> Self {
        self.params_schema = Some(schema);
        self
    }

    /// Attach a result schema.
    #[must_use]
    pub fn with_result(mut self, schema: Schema) -> Self {
        self.result_schema = Some(schema);
        self
    }
}

/// Public view of a registration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodInfo {
    /// Method name.
    pub name: String,
    /// Description given at registration.
    pub description: String,
    /// Whether params are validated.
    pub has_params_schema: bool,
    /// Whether results are validated.
    pub has_result_schema: bool,
}

/// Registration failures. None of them changes the registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    /// Method names must be non-empty.
    #[error("method name cannot be empty")]
    EmptyName,
    /// A handler is already registered under the name.
    #[error("method '{0}' is already registered")]
    Duplicate(String),
    /// No handler is registered under the name.
    #[error("method '{0}' is not registered")]
    NotRegistered(String),
}

struct MethodEntry {
    handler: Arc<dyn MethodHandler>,
    options: MethodOptions,
}

/// Name-keyed method registry plus dispatcher.
///
/// Registration goes through a lock so methods can be added while the
/// router is shared between connections.
pub struct Router {
    methods: RwLock<HashMap<String, Arc<MethodEntry>>>,
    validator: Validator,
    handler_timeout: Duration,
}

impl Router {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::with_handler_timeout(HANDLER_TIMEOUT)
    }

    /// Create an empty router with a custom handler timeout.
    pub fn with_handler_timeout(handler_timeout: Duration) -> Self {
        Self {
            methods: RwLock::new(HashMap::new()),
            validator: Validator::new(),
            handler_timeout,
        }
    }

    // ── Registry ────────────────────────────────────────────────────

    /// Register `handler` under `name`.
    pub fn register(
        &self,
        name: &str,
        handler: impl MethodHandler + 'static,
        options: MethodOptions,
    ) -> Result<(), RouterError> {
        if name.is_empty() {
            return Err(RouterError::EmptyName);
        }
        let mut methods = self.methods.write();
        if methods.contains_key(name) {
            return Err(RouterError::Duplicate(name.to_string()));
        }
        let entry = MethodEntry {
            handler: Arc::new(handler),
            options,
        };
        let _ = methods.insert(name.to_string(), Arc::new(entry));
        debug!(method = name, "rpc method registered");
        Ok(())
    }

    /// Register without schemas.
    pub fn register_simple(
        &self,
        name: &str,
        handler: impl MethodHandler + 'static,
        description: &str,
    ) -> Result<(), RouterError> {
        self.register(name, handler, MethodOptions::described(description))
    }

    /// Register with optional params and result schemas.
    pub fn register_with_validation(
        &self,
        name: &str,
        handler: impl MethodHandler + 'static,
        params_schema: Option<Schema>,
        result_schema: Option<Schema>,
        description: &str,
    ) -> Result<(), RouterError> {
        let options = MethodOptions {
            params_schema,
            result_schema,
            description: description.to_string(),
        };
        self.register(name, handler, options)
    }

    /// Remove a registration.
    pub fn unregister(&self, name: &str) -> Result<(), RouterError> {
        self.methods
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RouterError::NotRegistered(name.to_string()))
    }

    /// Whether `name` is registered.
    pub fn has_method(&self, name: &str) -> bool {
        self.methods.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Metadata for one registration.
    pub fn method_info(&self, name: &str) -> Result<MethodInfo, RouterError> {
        let methods = self.methods.read();
        let entry = methods
            .get(name)
            .ok_or_else(|| RouterError::NotRegistered(name.to_string()))?;
        Ok(MethodInfo {
            name: name.to_string(),
            description: entry.options.description.clone(),
            has_params_schema: entry.options.params_schema.is_some(),
            has_result_schema: entry.options.result_schema.is_some(),
        })
    }

    /// Number of registrations.
    pub fn method_count(&self) -> usize {
        self.methods.read().len()
    }

    /// Remove every registration.
    pub fn clear(&self) {
        self.methods.write().clear();
    }

    // ── Dispatch ────────────────────────────────────────────────────

    /// Dispatch one request. Returns `None` for notifications.
    pub async fn route(&self, request: Request, ctx: &RpcContext) -> Option<Response> {
        let notification = request.is_notification();

        if let Err(err) = self.validator.validate_request(&request) {
            if notification {
                debug!(error = %err, "dropping invalid notification");
                return None;
            }
            let id = request
                .id
                .filter(|id| id.is_string() || id.is_number())
                .unwrap_or(Value::Null);
            return Some(Response::error(id, envelope_error(&err).to_error_object()));
        }

        let Request {
            method, params, id, ..
        } = request;

        let outcome = self.dispatch(&method, params, ctx).await;

        let Some(id) = id else {
            if let Err(err) = outcome {
                debug!(method, error = %err, "notification failed");
            }
            return None;
        };

        Some(match outcome {
            Ok(result) => Response::success(id, result),
            Err(err) => Response::error(id, err.to_error_object()),
        })
    }

    /// Parse `bytes`, dispatch, and serialize the response.
    ///
    /// Unparseable input yields a `ParseError` response with a `null` id.
    /// Valid JSON that is not an object (batches included) yields
    /// `InvalidRequest` with a `null` id.
    pub async fn route_bytes(&self, bytes: &[u8], ctx: &RpcContext) -> Option<Vec<u8>> {
        let response = match serde_json::from_slice::<Value>(bytes) {
            Ok(value) => self.route_value(value, ctx).await?,
            Err(err) => {
                debug!(error = %err, "unparseable rpc frame");
                Response::error(Value::Null, RpcError::ParseError.to_error_object())
            }
        };
        Some(encode(&response).into_bytes())
    }

    /// Text-frame variant of [`route_bytes`](Self::route_bytes).
    pub async fn route_text(&self, text: &str, ctx: &RpcContext) -> Option<String> {
        let response = match serde_json::from_str::<Value>(text) {
            Ok(value) => self.route_value(value, ctx).await?,
            Err(err) => {
                debug!(error = %err, "unparseable rpc frame");
                Response::error(Value::Null, RpcError::ParseError.to_error_object())
            }
        };
        Some(encode(&response))
    }

    async fn route_value(&self, value: Value, ctx: &RpcContext) -> Option<Response> {
        if !value.is_object() {
            return Some(Response::error(
                Value::Null,
                RpcError::InvalidRequest {
                    message: "Invalid Request".to_string(),
                    data: Some(Value::String("request must be a JSON object".to_string())),
                }
                .to_error_object(),
            ));
        }

        let raw_id = value.get("id").filter(|id| !id.is_null());
        let has_id = raw_id.is_some();
        let recovered_id = raw_id
            .filter(|id| id.is_string() || id.is_number())
            .cloned()
            .unwrap_or(Value::Null);

        match serde_json::from_value::<Request>(value) {
            Ok(request) => self.route(request, ctx).await,
            Err(err) => {
                if !has_id {
                    debug!(error = %err, "dropping malformed notification");
                    return None;
                }
                Some(Response::error(
                    recovered_id,
                    RpcError::InvalidRequest {
                        message: "Invalid Request".to_string(),
                        data: Some(Value::String(err.to_string())),
                    }
                    .to_error_object(),
                ))
            }
        }
    }

    /// Steps 3–6 for an already-validated envelope.
    async fn dispatch(
        &self,
        method: &str,
        params: Option<Value>,
        ctx: &RpcContext,
    ) -> Result<Value, RpcError> {
        counter!(RPC_REQUESTS_TOTAL, "method" => method.to_string()).increment(1);

        let entry = self.methods.read().get(method).cloned();
        let Some(entry) = entry else {
            counter!(RPC_ERRORS_TOTAL, "method" => method.to_string(), "error_type" => "method_not_found").increment(1);
            return Err(RpcError::MethodNotFound {
                method: method.to_string(),
            });
        };

        if let Some(schema) = &entry.options.params_schema {
            let target = params.as_ref().unwrap_or(&Value::Null);
            if let Err(err) = self.validator.validate(schema, target) {
                counter!(RPC_ERRORS_TOTAL, "method" => method.to_string(), "error_type" => "invalid_params").increment(1);
                return Err(RpcError::InvalidParams {
                    message: "Parameter validation failed".to_string(),
                    data: Some(err.to_value()),
                });
            }
        }

        let start = Instant::now();
        let result = self.invoke(method, &entry, params, ctx).await;
        let elapsed = start.elapsed();
        histogram!(RPC_REQUEST_DURATION_SECONDS, "method" => method.to_string())
            .record(elapsed.as_secs_f64());
        if elapsed.as_secs() >= 5 {
            warn!(method, duration_secs = elapsed.as_secs_f64(), "slow RPC request");
        }

        let result = result.and_then(|value| {
            match &entry.options.result_schema {
                Some(schema) if !value.is_null() => self
                    .validator
                    .validate(schema, &value)
                    .map(|()| value)
                    .map_err(|err| {
                        error!(method, error = %err, "handler result failed validation");
                        RpcError::internal(format!("result validation failed: {}", err.message))
                    }),
                _ => Ok(value),
            }
        });

        if let Err(err) = &result {
            counter!(RPC_ERRORS_TOTAL, "method" => method.to_string(), "error_type" => err.kind()).increment(1);
        }
        result
    }

    /// Run the handler behind a panic boundary and the handler timeout.
    async fn invoke(
        &self,
        method: &str,
        entry: &MethodEntry,
        params: Option<Value>,
        ctx: &RpcContext,
    ) -> Result<Value, RpcError> {
        let guarded = AssertUnwindSafe(entry.handler.handle(params, ctx)).catch_unwind();
        match tokio::time::timeout(self.handler_timeout, guarded).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                error!(method, panic = %message, "rpc handler panicked");
                Err(RpcError::internal(format!("handler panic: {message}")))
            }
            Err(_elapsed) => {
                error!(method, "RPC handler timed out after {:?}", self.handler_timeout);
                Err(RpcError::internal(format!(
                    "handler for '{method}' timed out after {}s",
                    self.handler_timeout.as_secs()
                )))
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn envelope_error(err: &ValidationError) -> RpcError {
    RpcError::InvalidRequest {
        message: "Request validation failed".to_string(),
        data: Some(err.to_value()),
    }
}

fn encode(response: &Response) -> String {
    serde_json::to_string(response).unwrap_or_else(|err| {
        error!(error = %err, "failed to encode rpc response");
        ENCODE_FAILURE.to_string()
    })
}
