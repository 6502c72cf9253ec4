//! Binary entry point: wires the relay dispatcher up to Redis (presence,
//! queue, invites, fan-out), an optional Postgres account store, and an
//! axum HTTP/WebSocket listener.

use std::sync::Arc;

use axum::{
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use relaycore::accountstore::{AccountStore, InMemoryAccountStore, PgAccountStore};
use relaycore::config::{Args, RelayConfig};
use relaycore::pairing::{InviteStore, RedisInviteStore};
use relaycore::presence::{PresenceStore, RedisPresenceStore};
use relaycore::pubsub::{self, Fanout, RedisFanout};
use relaycore::queue::{MessageQueue, RedisMessageQueue};
use relaycore::safety::{SafetyLog, TracingSafetyLog};
use relaycore::state::RelayState;
use relaycore::handler;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relaycore=info,tower_http=info".into()),
        )
        .json()
        .init();

    let args = Args::parse();
    let config = RelayConfig::from(&args);

    tracing::info!(
        instance_id = %config.instance_id,
        port = config.port,
        "relay instance starting"
    );

    let redis_url = args.resolved_redis_url();
    let redis_cfg = deadpool_redis::Config::from_url(redis_url.clone());
    let redis_pool = redis_cfg
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .expect("failed to build redis connection pool");

    let presence: Arc<dyn PresenceStore> = Arc::new(RedisPresenceStore::new(redis_pool.clone()));
    let queue: Arc<dyn MessageQueue> = Arc::new(RedisMessageQueue::new(redis_pool.clone()));
    let invites: Arc<dyn InviteStore> = Arc::new(RedisInviteStore::new(redis_pool.clone()));
    let fanout: Arc<dyn Fanout> = Arc::new(RedisFanout::new(redis_pool));
    let safety: Arc<dyn SafetyLog> = Arc::new(TracingSafetyLog);

    let accounts: Arc<dyn AccountStore> = match &args.database_url {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .expect("failed to connect to account store database");
            Arc::new(PgAccountStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set — using an in-memory account store (not for production)");
            Arc::new(InMemoryAccountStore::new())
        }
    };

    let state = RelayState::new(config.clone(), presence, queue, invites, accounts, safety, fanout);

    // Long-lived subscriber: every instance listens for envelopes and
    // acks fanned out by other instances.
    let subscriber_state = state.clone();
    let subscriber_redis_url = redis_url.clone();
    tokio::spawn(async move {
        pubsub::run_subscriber(&subscriber_redis_url, move |message| {
            let state = subscriber_state.clone();
            async move {
                state.handle_fanout_message(message).await;
            }
        })
        .await;
    });

    let cleanup_state = state.clone();
    let cleanup_interval = args.cleanup_interval_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(cleanup_interval));
        loop {
            interval.tick().await;
            cleanup_state.cleanup_expired();
        }
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/ping", get(ping_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!(addr = %addr, "relay listening");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");

    axum::serve(listener, app).await.expect("server error");
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_websocket(socket, state))
}

/// `GET /ping → 200 "pong"`.
async fn ping_handler() -> &'static str {
    "pong"
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "relaycore",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "service": "relaycore",
        "version": env!("CARGO_PKG_VERSION"),
        "instance_id": state.config.instance_id,
        "local_sessions": state.online_local_sessions(),
    }))
}
