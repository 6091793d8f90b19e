//! Service reachability summary.

use axum::extract::State;
use axum::Json;
use serde_json::json;

use crate::state::AppState;

pub async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let (voice, video, database) = tokio::join!(
        state.voice.healthy(),
        state.video.healthy(),
        state.db.healthy()
    );

    let status = if voice && video && database {
        "healthy"
    } else {
        "degraded"
    };

    Json(json!({
        "status": status,
        "services": {
            "voice_service": up_or_down(voice),
            "video_service": up_or_down(video),
            "database": up_or_down(database),
        }
    }))
}

fn up_or_down(ok: bool) -> &'static str {
    if ok {
        "up"
    } else {
        "down"
    }
}
