//! Built-in RPC methods: `ping`, `echo`, `getSessionInfo`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use fle_rpc::{MethodHandler, MethodOptions, Router, RouterError, RpcContext, RpcError};
use fle_session::SessionManager;
use serde_json::{Value, json};
use tracing::instrument;

use crate::websocket::Hub;

/// Server name reported by `ping`.
pub const SERVER_NAME: &str = "fle-server";

/// Liveness probe over RPC.
pub struct PingHandler;

#[async_trait]
impl MethodHandler for PingHandler {
    async fn handle(&self, _params: Option<Value>, _ctx: &RpcContext) -> Result<Value, RpcError> {
        Ok(json!({
            "pong": true,
            "timestamp": Utc::now().to_rfc3339(),
            "server": SERVER_NAME,
        }))
    }
}

/// Return the params unchanged, or `{}` when absent.
pub struct EchoHandler;

#[async_trait]
impl MethodHandler for EchoHandler {
    async fn handle(&self, params: Option<Value>, _ctx: &RpcContext) -> Result<Value, RpcError> {
        Ok(params.unwrap_or_else(|| json!({})))
    }
}

/// Describe the caller's session and the server's load.
pub struct GetSessionInfoHandler {
    hub: Arc<Hub>,
    sessions: Arc<SessionManager>,
}

impl GetSessionInfoHandler {
    /// Handler reading counts from `hub` and `sessions`.
    pub fn new(hub: Arc<Hub>, sessions: Arc<SessionManager>) -> Self {
        Self { hub, sessions }
    }
}

#[async_trait]
impl MethodHandler for GetSessionInfoHandler {
    #[instrument(skip_all, fields(method = "getSessionInfo", session_code = %ctx.session_code))]
    async fn handle(&self, _params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        Ok(json!({
            "sessionCode": ctx.session_code,
            "totalSessions": self.sessions.session_count(),
            "activeConnections": self.hub.client_count(),
            "timestamp": Utc::now().to_rfc3339(),
        }))
    }
}

/// Register every built-in method on `router`.
pub fn register_builtin(
    router: &Router,
    hub: Arc<Hub>,
    sessions: Arc<SessionManager>,
) -> Result<(), RouterError> {
    router.register(
        "ping",
        PingHandler,
        MethodOptions::described("Check server liveness"),
    )?;
    router.register(
        "echo",
        EchoHandler,
        MethodOptions::described("Return the params unchanged"),
    )?;
    router.register(
        "getSessionInfo",
        GetSessionInfoHandler::new(hub, sessions),
        MethodOptions::described("Describe the caller's session"),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use fle_rpc::Request;
    use fle_session::SessionOptions;
    use tokio_util::sync::CancellationToken;

    fn ctx(code: &str) -> RpcContext {
        RpcContext::new(code, "conn_test")
    }

    fn fixtures() -> (Arc<Hub>, Arc<SessionManager>) {
        (
            Arc::new(Hub::new()),
            Arc::new(SessionManager::new(SessionOptions::default())),
        )
    }

    #[tokio::test]
    async fn ping_reports_server() {
        let result = PingHandler.handle(None, &ctx("a-b-1")).await.unwrap();
        assert_eq!(result["pong"], true);
        assert_eq!(result["server"], SERVER_NAME);
        assert!(result["timestamp"].is_string());
    }

    #[tokio::test]
    async fn echo_returns_params() {
        let params = json!({"hello": "world", "n": [1, 2, 3]});
        let result = EchoHandler.handle(Some(params.clone()), &ctx("a-b-1")).await.unwrap();
        assert_eq!(result, params);
    }

    #[tokio::test]
    async fn echo_without_params_is_empty_object() {
        let result = EchoHandler.handle(None, &ctx("a-b-1")).await.unwrap();
        assert_eq!(result, json!({}));
    }

    #[tokio::test]
    async fn session_info_reports_counts() {
        let (hub, sessions) = fixtures();
        let token = CancellationToken::new();
        let session = sessions.create_session(&token, None).unwrap();

        let handler = GetSessionInfoHandler::new(Arc::clone(&hub), Arc::clone(&sessions));
        let result = handler.handle(None, &ctx(&session.code)).await.unwrap();
        assert_eq!(result["sessionCode"], session.code.as_str());
        assert_eq!(result["totalSessions"], 1);
        assert_eq!(result["activeConnections"], 0);

        hub.shutdown().await;
        sessions.close().await;
    }

    #[tokio::test]
    async fn register_builtin_installs_all_methods() {
        let (hub, sessions) = fixtures();
        let router = Router::new();
        register_builtin(&router, Arc::clone(&hub), Arc::clone(&sessions)).unwrap();
        assert_eq!(router.methods(), vec!["echo", "getSessionInfo", "ping"]);

        let info = router.method_info("ping").unwrap();
        assert_eq!(info.description, "Check server liveness");

        hub.shutdown().await;
        sessions.close().await;
    }

    #[tokio::test]
    async fn register_builtin_twice_is_duplicate() {
        let (hub, sessions) = fixtures();
        let router = Router::new();
        register_builtin(&router, Arc::clone(&hub), Arc::clone(&sessions)).unwrap();
        let err = register_builtin(&router, Arc::clone(&hub), Arc::clone(&sessions)).unwrap_err();
        assert_matches!(err, RouterError::Duplicate(name) if name == "ping");

        hub.shutdown().await;
        sessions.close().await;
    }

    #[tokio::test]
    async fn echo_routes_through_router() {
        let (hub, sessions) = fixtures();
        let router = Router::new();
        register_builtin(&router, Arc::clone(&hub), Arc::clone(&sessions)).unwrap();

        let request: Request =
            serde_json::from_value(json!({"jsonrpc": "2.0", "method": "echo", "params": [1, 2], "id": 9}))
                .unwrap();
        let response = router.route(request, &ctx("a-b-1")).await.unwrap();
        assert_eq!(response.result, Some(json!([1, 2])));
        assert_eq!(response.id, json!(9));

        hub.shutdown().await;
        sessions.close().await;
    }
}
