//! HTTP surface: axum router, shared application state, and handlers.

mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{delete, get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::RegistryConfig;
use crate::registration::RegistrationService;
use crate::trace::status::TraceStatus;

/// Shared state handed to every handler.
pub struct AppState {
    pub registration: RegistrationService,
    pub config: RegistryConfig,
    pub trace_status: Arc<TraceStatus>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let request_id_header = axum::http::HeaderName::from_static("x-request-id");

    let middleware = ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(request_id_header.clone(), MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::new(request_id_header))
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(Duration::from_secs(30)));

    Router::new()
        .route("/agents/register", post(handlers::register))
        .route(
            "/agents/:agent_id/heartbeat",
            post(handlers::heartbeat).head(handlers::fast_heartbeat),
        )
        .route("/agents/:agent_id", delete(handlers::unregister))
        .route("/agents", get(handlers::list_agents))
        .route("/services/discover/:capability", get(handlers::discover))
        .route("/trace/status", get(handlers::trace_status))
        .route("/health", get(handlers::health))
        .layer(middleware)
        .with_state(state)
}
