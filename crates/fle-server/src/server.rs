//! `FleServer`: axum HTTP + WebSocket surface.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use fle_rpc::{Router, RouterError};
use fle_session::{SessionError, SessionManager};
use fle_settings::FleSettings;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::health::{self, HealthResponse};
use crate::methods::register_builtin;
use crate::metrics::render;
use crate::shutdown::{DrainReport, ShutdownCoordinator};
use crate::websocket::{ConnectionConfig, Hub, serve_socket};

/// Prometheus text exposition content type.
const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Server startup failures.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Binding or serving failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A built-in method could not be registered.
    #[error("method registration failed: {0}")]
    Router(#[from] RouterError),
    /// `server.corsOrigin` is not a valid header value.
    #[error("invalid CORS origin: {0}")]
    InvalidCorsOrigin(String),
}

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connection hub.
    pub hub: Arc<Hub>,
    /// RPC router shared by every connection.
    pub router: Arc<Router>,
    /// Session registry.
    pub sessions: Arc<SessionManager>,
    /// Effective settings.
    pub settings: Arc<FleSettings>,
    /// Per-connection transport limits.
    pub connection: ConnectionConfig,
    /// Prometheus render handle.
    pub metrics: PrometheusHandle,
    /// Cancelled on shutdown.
    pub shutdown: CancellationToken,
    /// When the server started.
    pub start_time: Instant,
}

/// Query string accepted by `/ws`.
#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    /// Session code to restore.
    pub session: Option<String>,
}

/// The FLE server.
pub struct FleServer {
    settings: Arc<FleSettings>,
    router: Arc<Router>,
    hub: Arc<Hub>,
    sessions: Arc<SessionManager>,
    metrics: PrometheusHandle,
    cors_origin: HeaderValue,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
}

impl FleServer {
    /// Create a server. Starts the hub and registers the built-in methods on
    /// `router`. Must be called inside a Tokio runtime.
    pub fn new(
        settings: FleSettings,
        router: Router,
        sessions: Arc<SessionManager>,
        metrics: PrometheusHandle,
    ) -> Result<Self, ServerError> {
        let cors_origin = HeaderValue::from_str(&settings.server.cors_origin)
            .map_err(|_| ServerError::InvalidCorsOrigin(settings.server.cors_origin.clone()))?;

        let shutdown = Arc::new(ShutdownCoordinator::new());
        let hub = Arc::new(Hub::with_shutdown(shutdown.token()));
        register_builtin(&router, Arc::clone(&hub), Arc::clone(&sessions))?;

        Ok(Self {
            settings: Arc::new(settings),
            router: Arc::new(router),
            hub,
            sessions,
            metrics,
            cors_origin,
            shutdown,
            start_time: Instant::now(),
        })
    }

    /// Build the axum router with all routes and layers.
    pub fn router(&self) -> axum::Router {
        let state = AppState {
            hub: Arc::clone(&self.hub),
            router: Arc::clone(&self.router),
            sessions: Arc::clone(&self.sessions),
            settings: Arc::clone(&self.settings),
            connection: ConnectionConfig::from_settings(&self.settings.websocket),
            metrics: self.metrics.clone(),
            shutdown: self.shutdown.token(),
            start_time: self.start_time,
        };

        let cors = CorsLayer::new()
            .allow_origin(self.cors_origin.clone())
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
            .max_age(Duration::from_secs(86_400));

        let app = axum::Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_handler))
            .with_state(state)
            .layer(cors);

        if self.settings.is_development() {
            app.layer(TraceLayer::new_for_http())
        } else {
            app
        }
    }

    /// Bind `server.host:server.port` and serve until shutdown.
    ///
    /// The serve task is tracked by the shutdown coordinator. Returns the
    /// bound address, which differs from the configured one for port `0`.
    pub async fn listen(&self) -> Result<SocketAddr, ServerError> {
        let listener = tokio::net::TcpListener::bind(self.settings.address()).await?;
        let local_addr = listener.local_addr()?;
        let app = self.router();
        let token = self.shutdown.token();

        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(err) = result {
                error!(error = %err, "http server failed");
            }
        });
        self.shutdown.track("http", handle);

        info!(
            addr = %local_addr,
            environment = %self.settings.environment,
            "server listening"
        );
        Ok(local_addr)
    }

    /// Stop accepting, drain the serve task, stop the hub, close the
    /// session registry.
    pub async fn shutdown_gracefully(&self) -> DrainReport {
        info!("shutting down");
        let report = self.shutdown.drain().await;
        self.hub.shutdown().await;
        self.sessions.close().await;
        info!(
            completed = report.completed.len(),
            aborted = report.aborted.len(),
            "shutdown complete"
        );
        report
    }

    /// Connection hub.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// RPC router.
    pub fn rpc_router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Session registry.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Effective settings.
    pub fn settings(&self) -> &FleSettings {
        &self.settings
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.hub.client_count(),
        state.sessions.session_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        render(&state.metrics),
    )
}

/// GET /ws?session=<code>
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let max_connections = state.settings.server.max_connections;
    if state.hub.client_count() >= max_connections {
        warn!(max_connections, "refusing upgrade, connection limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "Server at capacity").into_response();
    }

    let session_code = match resolve_session(&state.sessions, query.session.as_deref(), &state.shutdown) {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, code = err.code(), "failed to create session");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to create session").into_response();
        }
    };

    let ws_settings = &state.settings.websocket;
    let AppState {
        hub,
        router,
        connection,
        ..
    } = state.clone();
    ws.max_message_size(ws_settings.max_message_size)
        .read_buffer_size(ws_settings.read_buffer_size)
        .write_buffer_size(ws_settings.write_buffer_size)
        .on_upgrade(move |socket| serve_socket(socket, session_code, hub, router, connection))
}

/// Restore the requested session, or mint a new one when it is absent,
/// unknown, expired, or malformed.
fn resolve_session(
    sessions: &SessionManager,
    requested: Option<&str>,
    shutdown: &CancellationToken,
) -> Result<String, SessionError> {
    if let Some(requested) = requested.filter(|code| !code.is_empty()) {
        match sessions.get_session(requested) {
            Ok(session) => {
                debug!(session_code = %session.code, "restored existing session");
                return Ok(session.code);
            }
            Err(err) => {
                debug!(requested, reason = err.code(), "session not restorable, creating new one");
            }
        }
    }
    let session = sessions.create_session(shutdown, None)?;
    debug!(session_code = %session.code, "created new session");
    Ok(session.code)
}
