//! Parley gateway library logic.

pub mod api_presence;
pub mod api_ws;
pub mod background;
pub mod config;
pub mod error;
pub mod fabric;
pub mod frames;
pub mod middleware;
pub mod persist;
pub mod presence;
pub mod rooms;

use axum::{routing::get, Extension, Json, Router};
use fabric::Fabric;
use parley_db::DbPool;
use parley_identity::TokenSecret;
use presence::PresenceStore;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};

/// Limits applied to every connection.
#[derive(Debug, Clone, Copy)]
pub struct GatewayLimits {
    /// Largest accepted inbound text frame, in bytes.
    pub max_message_len: usize,
}

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// Key used to verify bearer credentials.
    pub token_secret: Arc<TokenSecret>,
    /// Publish/subscribe fabric.
    pub fabric: Fabric,
    /// Fleet-wide presence store.
    pub presence: PresenceStore,
    /// Identity of this process in the presence store.
    pub node_id: String,
    /// Per-connection limits.
    pub limits: GatewayLimits,
    /// Flips to `true` once the process starts shutting down.
    pub shutdown: Arc<watch::Sender<bool>>,
}

impl AppState {
    pub fn new(
        pool: DbPool,
        token_secret: TokenSecret,
        fabric: Fabric,
        presence: PresenceStore,
        node_id: String,
        limits: GatewayLimits,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            pool,
            token_secret: Arc::new(token_secret),
            fabric,
            presence,
            node_id,
            limits,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Asks every open connection to close and release its presence.
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route(
            "/api/presence/{user_id}",
            get(api_presence::get_presence_handler),
        )
        .layer(axum::middleware::from_fn(middleware::auth_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/ws/chat/{peer_id}", get(api_ws::chat_ws_handler))
        .route("/ws/chat/{peer_id}/", get(api_ws::chat_ws_handler))
        .route("/ws/notify", get(api_ws::notify_ws_handler))
        .route("/ws/notify/", get(api_ws::notify_ws_handler))
        .merge(protected_routes)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
