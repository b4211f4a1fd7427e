//! Axum-based WebSocket server.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use serde_json::json;
use switchboard_orchestrator::SessionManager;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::connection::handle_ws_connection;

/// Shared handles every request sees.
pub struct AppState {
    pub manager: Arc<SessionManager>,
    #[cfg(feature = "metrics")]
    pub prometheus: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl AppState {
    pub fn new(manager: Arc<SessionManager>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            #[cfg(feature = "metrics")]
            prometheus: None,
        })
    }

    #[cfg(feature = "metrics")]
    pub fn with_prometheus(
        manager: Arc<SessionManager>,
        handle: metrics_exporter_prometheus::PrometheusHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            prometheus: Some(handle),
        })
    }
}

/// Start the voice WebSocket server and block until shutdown.
pub async fn start_server(manager: Arc<SessionManager>, bind: &str, port: u16) -> anyhow::Result<()> {
    #[cfg(feature = "metrics")]
    let state = AppState::with_prometheus(
        Arc::clone(&manager),
        crate::metrics::install_prometheus_recorder(),
    );
    #[cfg(not(feature = "metrics"))]
    let state = AppState::new(Arc::clone(&manager));

    let addr = format!("{bind}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Switchboard listening on {addr}");

    // Session cancellation must run before serve() can finish: open
    // WebSockets only drain once their sessions emit SessionClosed.
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(manager))
        .await?;

    Ok(())
}

/// The full route table. Split out so tests can drive it on an ephemeral
/// listener without signal handling.
pub fn router(state: Arc<AppState>) -> Router {
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler));

    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(metrics_handler));

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

#[derive(Deserialize)]
struct WsQuery {
    /// Resume a stored session instead of minting a fresh id.
    session: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(state, socket, query.session))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");
    let sessions = state.manager.active_sessions().await;
    let scenario = state.manager.registry().await.scenario_name().to_string();

    axum::Json(json!({
        "status": "ok",
        "version": version,
        "sessions": sessions,
        "scenario": scenario,
    }))
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<Arc<AppState>>) -> axum::response::Response {
    use axum::http::StatusCode;

    let Some(handle) = &state.prometheus else {
        return (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed")
            .into_response();
    };

    // Pool levels are sampled at scrape time; the counters are updated as
    // events flow through connections.
    let (stt, tts) = state.manager.pool_metrics().await;
    crate::metrics::record_pool_levels("stt", &stt);
    crate::metrics::record_pool_levels("tts", &tts);

    handle.render().into_response()
}

async fn shutdown_signal(manager: Arc<SessionManager>) {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    info!("Shutdown signal received");
    // Stops live sessions, the idle sweeper, and pool maintenance.
    manager.shutdown();
}
