//! HTTP routes

pub mod health;

use axum::{http::HeaderValue, routing::get, Router};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{error::ApiError, state::AppState, websocket::ws_handler};

/// Create all routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // WebSocket gateway (auth handled in handler via query parameter)
    let websocket_routes = Router::new().route("/ws", get(ws_handler));

    let cors = cors_layer(&state.config.allowed_origins);

    Router::new()
        .merge(health_routes)
        .merge(websocket_routes)
        .fallback(|| async { ApiError::NotFound })
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Any origin when none are configured, otherwise exactly the listed ones
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(origins))
    }
}
