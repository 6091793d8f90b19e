//! Realtime avatar conversations: `/voice-chat` and `/video-chat`.

pub mod mediator;
mod upstream;

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use vocara_core::session::SessionKind;

use crate::error::ApiError;
use crate::state::AppState;
use mediator::SessionParams;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatQuery {
    pub avatar_id: String,
    pub token: String,
    #[serde(default)]
    pub voice_url: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

pub async fn voice_chat_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<ChatQuery>,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, state, query, SessionKind::Voice).await
}

pub async fn video_chat_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<ChatQuery>,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, state, query, SessionKind::Video).await
}

/// Token and avatar are checked before the upgrade completes so bad
/// requests fail with a proper HTTP status instead of a socket close.
async fn upgrade(
    ws: WebSocketUpgrade,
    state: AppState,
    query: ChatQuery,
    kind: SessionKind,
) -> Response {
    let owner_id = match state.verifier.verify(&query.token).await {
        Ok(owner_id) => owner_id,
        Err(_) => return ApiError::unauthorized().into_response(),
    };

    let avatar = match state.avatars.get(query.avatar_id.trim()).await {
        Ok(Some(avatar)) => avatar,
        Ok(None) => return ApiError::not_found("Avatar not found").into_response(),
        Err(err) => return ApiError::from(err).into_response(),
    };

    let params = SessionParams {
        kind,
        owner_id,
        language: query
            .language
            .or_else(|| avatar.language.clone())
            .unwrap_or_else(|| "en".to_string()),
        voice_clone_url: query.voice_url.or_else(|| avatar.voice_sample_url.clone()),
        avatar,
    };

    ws.on_upgrade(move |socket| mediator::run_session(socket, state, params))
}
