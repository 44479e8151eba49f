mod config;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use classhub_db::Database;
use classhub_gateway::auth::JwtIdentityProvider;
use classhub_gateway::connection;
use classhub_gateway::oracle::{HistorySink, IdentityProvider, MemorySink};
use classhub_gateway::{ConnectionRegistry, Dispatcher, RoomStateStore};
use classhub_types::api::HealthResponse;

use crate::config::Config;

#[derive(Clone)]
struct ServerState {
    dispatcher: Dispatcher,
    identity: Arc<dyn IdentityProvider>,
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "classhub_server=debug,classhub_gateway=debug,classhub_db=debug,tower_http=debug".into()
            }),
        )
        .init();

    let config = Config::from_env()?;

    // Init database: membership oracle always, history sink unless disabled
    let db = Arc::new(Database::open(&config.db_path)?);
    let sink: Arc<dyn HistorySink> = if config.persist_history {
        db.clone()
    } else {
        warn!("CLASSHUB_PERSIST_HISTORY is off; room history will not survive a restart");
        Arc::new(MemorySink::new())
    };

    let store = RoomStateStore::new(sink, config.store_retry);
    store.rehydrate().await?;

    let identity: Arc<dyn IdentityProvider> = Arc::new(JwtIdentityProvider::new(&config.jwt_secret));
    let dispatcher = Dispatcher::new(ConnectionRegistry::new(), store, db, identity.clone());

    let state = ServerState {
        dispatcher,
        identity,
    };

    let app = Router::new()
        .route("/gateway", get(ws_upgrade))
        .route("/health", get(health))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("Classhub gateway listening on {}", config.addr);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Classhub gateway stopped");
    Ok(())
}

/// A token in the query string is checked before the upgrade; without one the
/// socket opens unbound and must `identify` itself.
async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = match query.token.as_deref() {
        Some(token) => match state.identity.identify(token) {
            Some(identity) => Some(identity),
            None => return StatusCode::UNAUTHORIZED.into_response(),
        },
        None => None,
    };

    ws.on_upgrade(move |socket| connection::handle_connection(socket, state.dispatcher, identity))
}

async fn health(State(state): State<ServerState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.dispatcher.registry().connection_count().await,
        rooms: state.dispatcher.store().room_count().await,
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
