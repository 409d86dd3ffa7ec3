pub mod error;
mod handlers;

use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::archive::CoverArchive;
use crate::config::DEFAULT_LONG_POLL_SECS;
use crate::shutdown::ShutdownCoordinator;
use crate::sync::SyncState;

use handlers::*;

/// Limit for JSON bodies (`init`, `update`, `reset`).
pub const JSON_BODY_LIMIT: usize = 64 * 1024;
/// Limit for controller log lines.
pub const LOG_BODY_LIMIT: usize = 4 * 1024;
/// Limit for uploaded cover images.
pub const COVER_BODY_LIMIT: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub sync: SyncState,
    pub shutdown: ShutdownCoordinator,
    /// Write-once on-disk copy of accepted covers, if configured.
    pub archive: Option<CoverArchive>,
    /// How long `GET /cover` waits before answering empty.
    pub long_poll_timeout: Duration,
}

impl AppState {
    pub fn new(sync: SyncState, shutdown: ShutdownCoordinator) -> Self {
        Self {
            sync,
            shutdown,
            archive: None,
            long_poll_timeout: Duration::from_secs(DEFAULT_LONG_POLL_SECS),
        }
    }
}

/// Configuration for the HTTP/WS router.
///
/// Use `RouterConfig::default()` in tests for a minimal setup.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    pub cors_origins: Vec<String>,
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let controller_routes = Router::new()
        .route("/connect", get(connect))
        .route("/init", post(init))
        .route("/update/{field}", post(update))
        .route(
            "/log",
            post(log).layer(DefaultBodyLimit::max(LOG_BODY_LIMIT)),
        );

    let cover_routes = Router::new()
        .route(
            "/cover",
            get(cover_poll)
                .post(cover_upload)
                .layer(DefaultBodyLimit::max(COVER_BODY_LIMIT)),
        )
        .route("/cover/ws", get(cover_ws))
        .route("/cover/image", get(cover_image));

    let display_routes = Router::new()
        .route("/state", get(snapshot))
        .route("/session/reset", post(reset))
        .route("/ws/events", get(ws_events));

    let router = Router::new()
        .route("/health", get(health))
        .merge(controller_routes)
        .merge(cover_routes)
        .merge(display_routes)
        .with_state(state)
        .layer(DefaultBodyLimit::max(JSON_BODY_LIMIT))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(TraceLayer::new_for_http());

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
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE]),
        )
    }
}
