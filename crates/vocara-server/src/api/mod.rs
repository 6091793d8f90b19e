//! API routes and handlers.

pub mod audio_generation;
pub mod health;
pub mod request_context;
mod router;
pub mod video_generation;
pub mod worker_callback;

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;

use crate::error::ApiError;
use crate::state::AppState;

pub use router::create_router;

/// Resolve the caller from the `Authorization: Bearer` header.
pub(crate) async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<String, ApiError> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(ApiError::unauthorized)?;

    state.verifier.verify(bearer).await.map_err(ApiError::from)
}
