//! HTTP host for the protocol engine.
//!
//! One upgrade route plus a health probe. Everything interesting
//! happens after the upgrade, in `connection::run_connection`; this
//! module only extracts the query parameters and whatever identity
//! the fronting auth middleware left in the request extensions.

use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Extension, Router};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use tether_core::Principal;

use crate::connection::{self, ConnectParams};
use crate::registry::ConnectionRegistry;
use crate::router::CommandRouter;
use crate::transport;

/// Default per-send and per-read chunk bound.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub ws_path: String,
    pub buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9090,
            ws_path: "/ws".into(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<CommandRouter>,
    pub shutdown: CancellationToken,
}

/// Upgrade-request query parameters.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectQuery {
    connection_token: Option<String>,
    /// Presence-only flag; any value (including empty) enables it.
    debug: Option<String>,
}

/// Build the Axum router with the upgrade and health routes.
pub fn build_router(state: AppState, ws_path: &str) -> Router {
    Router::new()
        .route(ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Create and start the server. Returns a handle that owns the
/// registry and keeps the serve task alive.
pub async fn start(
    config: ServerConfig,
    router: Arc<CommandRouter>,
    shutdown: CancellationToken,
) -> Result<ServerHandle, std::io::Error> {
    let registry = Arc::new(ConnectionRegistry::new(
        config.buffer_size,
        shutdown.clone(),
    ));

    let state = AppState {
        registry: Arc::clone(&registry),
        router,
        shutdown: shutdown.clone(),
    };
    let app = build_router(state, &config.ws_path);

    // Pre-registrations that are never claimed would otherwise sit in
    // the map forever; sweep them out on a coarse interval.
    let sweeper = Arc::clone(&registry);
    let sweep_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = sweep_shutdown.cancelled() => break,
                _ = tick.tick() => {
                    let purged = sweeper.purge_expired(chrono::Utc::now());
                    if purged > 0 {
                        tracing::debug!(purged, "expired pre-registrations removed");
                    }
                }
            }
        }
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), path = %config.ws_path, "tether server started");

    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        registry,
        _server: server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    /// Exposed so background producers can deliver and the
    /// token-exchange path can preregister sessions.
    pub registry: Arc<ConnectionRegistry>,
    _server: tokio::task::JoinHandle<()>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    principal: Option<Extension<Principal>>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let params = ConnectParams {
        connection_token: query.connection_token,
        debug: query.debug.is_some(),
    };
    let principal = principal.map(|Extension(p)| p);
    ws.on_upgrade(move |socket| handle_socket(socket, params, principal, state))
}

/// Run the protocol loop for one accepted socket.
async fn handle_socket(
    socket: WebSocket,
    params: ConnectParams,
    principal: Option<Principal>,
    state: AppState,
) {
    let (source, sink) = transport::split_socket(socket);
    connection::run_connection(
        Box::new(source),
        Box::new(sink),
        params,
        principal,
        state.registry,
        state.router,
        state.shutdown,
    )
    .await;
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "connections": state.registry.count(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> AppState {
        let shutdown = CancellationToken::new();
        AppState {
            registry: Arc::new(ConnectionRegistry::new(DEFAULT_BUFFER_SIZE, shutdown.clone())),
            router: Arc::new(CommandRouter::new()),
            shutdown,
        }
    }

    #[test]
    fn build_router_creates_routes() {
        let _router = build_router(test_state(), "/ws");
    }

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 9090);
        assert_eq!(config.ws_path, "/ws");
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let shutdown = CancellationToken::new();
        let config = ServerConfig {
            port: 0, // random port
            ..Default::default()
        };
        let handle = start(config, Arc::new(CommandRouter::new()), shutdown.clone())
            .await
            .unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);

        shutdown.cancel();
    }
}
