use axum::extract::{DefaultBodyLimit, Request};
use axum::http::HeaderValue;
use axum::routing::{delete, get, post};
use axum::{middleware, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info_span, warn};

use crate::api::request_context::attach_request_context;
use crate::api::{audio_generation, health, video_generation, worker_callback};
use crate::state::AppState;
use crate::ws;

/// Worker uploads carry the finished render; cap at 300 MiB.
const CALLBACK_BODY_LIMIT: usize = 300 * 1024 * 1024;

/// Create the main API router.
pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http().make_span_with(|request: &Request| {
        let request_id = request
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        info_span!(
            "http_request",
            method = %request.method(),
            uri = %request.uri(),
            correlation_id = %request_id
        )
    });

    Router::new()
        .route(
            "/api/audio-generation/generate",
            post(audio_generation::generate),
        )
        .route(
            "/api/audio-generation/status/:task_id",
            get(audio_generation::status),
        )
        .route("/api/audio-generation/:id", delete(audio_generation::remove))
        .route(
            "/api/video-generation/generate",
            post(video_generation::generate),
        )
        .route(
            "/api/video-generation/status/:task_id",
            get(video_generation::status),
        )
        .route("/api/video-generation/:id", delete(video_generation::remove))
        .route(
            "/worker/callback",
            post(worker_callback::receive).layer(DefaultBodyLimit::max(CALLBACK_BODY_LIMIT)),
        )
        .route("/health", get(health::health_check))
        .route("/voice-chat", get(ws::voice_chat_upgrade))
        .route("/video-chat", get(ws::video_chat_upgrade))
        .layer(trace_layer)
        .layer(middleware::from_fn(attach_request_context))
        .layer(cors_layer(state.settings.frontend_origin.as_deref()))
        .with_state(state)
}

/// Allow-list the configured frontend origin; without one, fall back to
/// permissive development CORS.
fn cors_layer(frontend_origin: Option<&str>) -> CorsLayer {
    match frontend_origin {
        Some(origin) => match origin.parse::<HeaderValue>() {
            Ok(origin) => CorsLayer::new()
                .allow_origin(origin)
                .allow_methods(Any)
                .allow_headers(Any),
            Err(_) => {
                warn!("FRONTEND_URL is not a valid origin, using permissive CORS");
                permissive_cors()
            }
        },
        None => permissive_cors(),
    }
}

fn permissive_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
