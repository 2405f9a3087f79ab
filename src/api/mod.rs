pub mod error;
mod handlers;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use std::sync::Arc;

use crate::orchestrator::PairingService;
use crate::session::SessionRecord;
use crate::shutdown::ShutdownCoordinator;

use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PairingService>,
    pub shutdown: ShutdownCoordinator,
}

pub(crate) fn get_session(state: &AppState, id: &str) -> Result<SessionRecord, error::ApiError> {
    state
        .service
        .registry()
        .get(id)
        .ok_or_else(|| error::ApiError::SessionNotFound(id.to_string()))
}

/// Configuration for the HTTP/WS router.
///
/// Use `RouterConfig::default()` in tests for a minimal setup.
#[derive(Default)]
pub struct RouterConfig {
    pub cors_origins: Vec<String>,
    /// Per-IP requests per second on the session-creation routes.
    pub rate_limit: Option<u32>,
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let creation_routes = Router::new()
        .route("/sessions", post(session_create))
        .route("/code", get(code))
        .route("/qr", get(qr));

    // Creating a session spins up a protocol connection, so only these
    // routes are throttled.
    let creation_routes = if let Some(rps) = config.rate_limit.filter(|r| *r > 0) {
        use tower_governor::{GovernorLayer, governor::GovernorConfigBuilder, key_extractor::PeerIpKeyExtractor};
        match GovernorConfigBuilder::default()
            .per_second(u64::from(rps))
            .burst_size(rps)
            .key_extractor(PeerIpKeyExtractor)
            .finish()
        {
            Some(conf) => creation_routes.layer(GovernorLayer::new(Arc::new(conf))),
            None => {
                tracing::warn!(rps, "invalid rate limit, serving without one");
                creation_routes
            }
        }
    } else {
        creation_routes
    };

    let session_routes = Router::new()
        .route("/sessions/{id}", get(session_get).delete(session_delete))
        .route("/sessions/{id}/ws", get(ws_push))
        .route("/sessions/{id}/events", get(sse_push));

    let router = Router::new()
        .route("/health", get(health))
        .merge(creation_routes)
        .merge(session_routes)
        .with_state(state)
        .layer(DefaultBodyLimit::max(16 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ));

    // Conditionally apply CORS if origins are configured.
    if config.cors_origins.is_empty() {
        router
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE]),
        )
    }
}
