//! Parley gateway binary.
//!
//! Starts an axum HTTP/WebSocket server with structured logging, database
//! initialization, presence and fabric backends chosen by configuration, and
//! graceful shutdown on SIGTERM/SIGINT.

use parley_identity::TokenSecret;
use parley_server::config::{self, FabricBackend, PresenceBackend};
use parley_server::fabric::Fabric;
use parley_server::presence::{announce_departures, PresenceStore, RedisPresence, SqlitePresence};
use parley_server::{app, background, AppState, GatewayLimits};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// How long open connections get to release their presence on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("PARLEY_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    // Load configuration
    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration; the server cannot start without valid config");

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    // Initialize database
    let pool = parley_db::create_pool(&config.database.path, config.database.runtime_settings())
        .expect("failed to create database pool; check database.path in config");

    {
        let conn = pool
            .get()
            .expect("failed to get database connection for migrations");
        let applied = parley_db::run_migrations(&conn).expect("failed to run database migrations");
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }
    }

    let node_id = config
        .gateway
        .node_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let token_secret = match config.auth.token_secret.as_deref() {
        Some(material) if !material.is_empty() => TokenSecret::derive(material),
        _ => {
            tracing::warn!(
                "auth.token_secret is not set; using a random per-process secret, \
                 credentials issued elsewhere will be rejected"
            );
            TokenSecret::derive(&Uuid::new_v4().to_string())
        }
    };

    let redis_url = config
        .required_redis_url()
        .expect("configuration was validated at load");

    // Select backends
    let capacity = config.gateway.mailbox_capacity;
    let fabric = match (config.fabric.backend, redis_url) {
        (FabricBackend::Redis, Some(url)) => Fabric::redis(url, &config.fabric.prefix, capacity)
            .await
            .expect("failed to connect the redis fabric; check fabric.redis_url"),
        _ => Fabric::local(capacity),
    };

    let presence = match (config.presence.backend, redis_url) {
        (PresenceBackend::Redis, Some(url)) => PresenceStore::Redis(
            RedisPresence::connect(
                url,
                &config.fabric.prefix,
                &node_id,
                config.presence.stale_after_secs,
            )
            .await
            .expect("failed to connect the redis presence store; check fabric.redis_url"),
        ),
        _ => PresenceStore::Sqlite(SqlitePresence::new(pool.clone(), &node_id)),
    };

    tracing::info!(
        node_id = %node_id,
        fabric = fabric.backend_name(),
        presence = presence.backend_name(),
        "selected gateway backends"
    );

    // Release what a previous run of this node left behind
    let departures = presence
        .purge_node()
        .await
        .expect("failed to purge presence left by a previous run of this node");
    if !departures.is_empty() {
        tracing::info!(count = departures.len(), "released presence from a previous run");
        announce_departures(&fabric, &departures).await;
    }

    let state = AppState::new(
        pool,
        token_secret,
        fabric,
        presence,
        node_id,
        GatewayLimits {
            max_message_len: config.gateway.max_message_len,
        },
    );

    tokio::spawn(background::start_presence_heartbeat(
        Arc::new(state.clone()),
        config.presence.heartbeat_secs,
        config.presence.stale_after_secs,
    ));

    // Build application
    let app = app(state.clone());
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting parley gateway");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address; is another process using this port?");

    // Serve with graceful shutdown
    let shutdown_state = state.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        shutdown_state.begin_shutdown();
    })
    .await
    .expect("server error");

    drain_connections(&state).await;
    tracing::info!("parley gateway shut down");
}

/// Waits for open connections to finish their cleanup.
async fn drain_connections(state: &AppState) {
    let table = state.fabric.local_table();
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while table.connection_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;

    if drained.is_err() {
        tracing::warn!(
            remaining = table.connection_count().await,
            "shutdown drain timed out; remaining presence is released on next start"
        );
    }
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
