use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use ingest_core::IngestError;
use ingest_store::EnvelopeSink;
use ingest_telemetry::metrics::{self, MetricsRecorder};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::IngestConfig;
use crate::session::{SessionCoordinator, SessionRegistry};
use crate::transport::split_socket;

/// Upper bound on how long shutdown waits for sessions to drain.
const SHUTDOWN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind: String,
    pub ingest: IngestConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:9091".into(),
            ingest: IngestConfig::default(),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SessionCoordinator>,
    pub metrics: Arc<MetricsRecorder>,
}

impl AppState {
    pub fn new(config: IngestConfig, sink: Arc<dyn EnvelopeSink>, metrics: Arc<MetricsRecorder>) -> Self {
        let coordinator = SessionCoordinator::new(Arc::new(config), sink, Arc::clone(&metrics));
        Self {
            coordinator: Arc::new(coordinator),
            metrics,
        }
    }
}

/// HTTP rendering of the one peer-visible error.
pub struct ApiError(pub IngestError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            IngestError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "kind": self.0.error_kind(),
        });
        (status, Json(body)).into_response()
    }
}

/// Mount the ingestion endpoint in front of `next`. Requests to any other
/// path go to `next` untouched.
pub fn build_router(state: AppState, next: Router) -> Router {
    let path = state.coordinator.config().endpoint_path.clone();
    Router::new()
        .route(&path, any(ingest_handler))
        .with_state(state)
        .fallback_service(next)
}

/// The routes served behind the ingestion endpoint by default.
pub fn default_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind, start serving, and return a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    sink: Arc<dyn EnvelopeSink>,
    metrics: Arc<MetricsRecorder>,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState::new(config.ingest, sink, metrics);
    let coordinator = Arc::clone(&state.coordinator);
    let router = build_router(state.clone(), default_routes(state)).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    let local_addr = listener.local_addr()?;
    info!(
        addr = %local_addr,
        endpoint = %coordinator.config().endpoint_path,
        "ingest server started"
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone().cancelled_owned();
    let join = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(signal).await {
            warn!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        coordinator,
        shutdown,
        join,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    coordinator: Arc<SessionCoordinator>,
    shutdown: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.coordinator.registry()
    }

    /// Stop accepting, cancel every session, wait for them to drain.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.coordinator.shutdown()).await.is_err() {
            warn!(
                remaining = self.coordinator.registry().count(),
                "shutdown timed out after {SHUTDOWN_TIMEOUT:?}, sessions still draining"
            );
        }
        if let Err(e) = self.join.await {
            warn!(error = %e, "server task failed");
        }
        info!("ingest server stopped");
    }
}

/// Upgrade to WebSocket and run a session, or 400 for anything else.
async fn ingest_handler(
    State(state): State<AppState>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let ws = upgrade.map_err(|rejection| ApiError(IngestError::BadRequest(rejection.body_text())))?;

    let coordinator = state.coordinator;
    let max_bytes = coordinator.config().max_frame_bytes;
    Ok(ws
        .max_message_size(max_bytes)
        .max_frame_size(max_bytes)
        .on_upgrade(move |socket| async move {
            let session = coordinator.open();
            let (reader, writer, link) = split_socket(socket);
            coordinator.run(session, reader, writer, link).await;
        }))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "active_sessions": state.coordinator.registry().count(),
        "envelopes_received": state.metrics.counter_get(metrics::ENVELOPES_RECEIVED, &[]),
        "envelopes_persisted": state.metrics.counter_get(metrics::ENVELOPES_PERSISTED, &[]),
        "envelopes_failed": state.metrics.counter_get(metrics::ENVELOPES_FAILED, &[]),
        "metrics": state.metrics.snapshot(),
    }))
}
