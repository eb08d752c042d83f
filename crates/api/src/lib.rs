// Realtime voice conversation gateway HTTP/websocket surface.
//
// This crate is deliberately thin: it owns only the axum wiring (`AppState`,
// routing) and the adapters that bind the websocket-agnostic `services`
// layer to a concrete socket (`routes::gateway::WsSink`) and a concrete
// archive (`archiver::DatabaseArchiver`). Everything with actual gateway
// logic lives in `domain`/`services`.

pub mod archiver;
pub mod heartbeat;
pub mod middleware;
pub mod routes;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use config::GatewayConfig;
use domain::TokenVerifier;
use services::gateway::{ConnectionRegistry, MessageRouter, MetricsCollector, SessionStore};
use tower_http::cors::{Any, CorsLayer};

/// Shared state handed to every axum handler. Every field is an `Arc` so
/// cloning `AppState` per request is cheap (spec §4.G).
#[derive(Clone)]
pub struct AppState {
    pub token_verifier: Arc<TokenVerifier>,
    pub session_store: Arc<SessionStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub metrics: Arc<MetricsCollector>,
    pub router: Arc<MessageRouter>,
    pub config: Arc<GatewayConfig>,
}

/// Assembles the full router: the websocket upgrade at the fixed path plus
/// liveness/readiness probes (spec §4.G, SPEC_FULL §9.4).
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/socket.io/", get(routes::gateway::gateway_handler))
        .route("/health", get(routes::health::health_check))
        .route("/health/ready", get(routes::health::readiness_check))
        .layer(cors)
        .with_state(state)
}
