//! HTTP server for signaling and health checks
//!
//! Routes the publisher/viewer signaling WebSocket, the generic WebSocket,
//! a health endpoint, a peer listing and, when configured, the static
//! browser client.

use crate::broker::PeerSummary;
use crate::transport::{handle_generic_connection, handle_signaling_connection, ConnectionParams, ConnectionQuery};
use crate::web::shared::SharedState;
use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use log::{info, warn};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::services::{ServeDir, ServeFile};

/// Build the application router
pub fn build_router(state: Arc<SharedState>) -> Router {
    let server = &state.config.server;
    let app = Router::new()
        .route(&server.signaling_path, get(signaling_handler))
        .route(&server.generic_path, get(generic_handler))
        .route("/health", get(health_handler))
        .route("/peers", get(peers_handler));

    match server.web_root.clone() {
        Some(root) => {
            info!("Serving web client from {:?}", root);
            if !root.join("index.html").exists() {
                warn!("Web client index not found at {:?}", root.join("index.html"));
            }
            let static_service = ServeDir::new(&root).fallback(ServeFile::new(root.join("index.html")));
            app.fallback_service(static_service).with_state(state)
        }
        None => app.with_state(state),
    }
}

/// Run the HTTP server until `shutdown` resolves
pub async fn run_http_server<F>(state: Arc<SharedState>, shutdown: F) -> Result<(), Box<dyn std::error::Error>>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    info!(
        "Signaling endpoint at {}, generic endpoint at {}",
        state.config.server.signaling_path, state.config.server.generic_path
    );
    let app = build_router(state);

    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;

    Ok(())
}

/// Resolve an upgrade query, rejecting requests without a peer identity
fn connection_params(query: ConnectionQuery) -> Result<ConnectionParams, (StatusCode, &'static str)> {
    ConnectionParams::from_query(query).ok_or((StatusCode::BAD_REQUEST, "peerId query parameter is required"))
}

async fn signaling_handler(
    State(state): State<Arc<SharedState>>,
    Query(query): Query<ConnectionQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    match connection_params(query) {
        Ok(params) => ws
            .on_upgrade(move |socket| handle_signaling_connection(socket, params, state))
            .into_response(),
        Err(rejection) => {
            warn!("Rejecting signaling upgrade: {}", rejection.1);
            rejection.into_response()
        }
    }
}

async fn generic_handler(State(state): State<Arc<SharedState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_generic_connection(socket, state))
}

/// Health check handler
async fn health_handler(State(state): State<Arc<SharedState>>) -> Json<Value> {
    let stats = state.broker.stats();
    Json(json!({
        "status": "healthy",
        "uptime_seconds": state.uptime().as_secs_f64(),
        "peers": stats.peers,
        "connections": stats.connections,
        "generic_connections": stats.generic_connections,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn peers_handler(State(state): State<Arc<SharedState>>) -> Json<Vec<PeerSummary>> {
    Json(state.broker.snapshot())
}
