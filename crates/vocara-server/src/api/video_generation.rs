//! Talking-head video endpoints.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use vocara_core::job::{JobInput, JobKind, JobQuality, NewJob};
use vocara_core::usage::{estimated_video_minutes, Admission, UsageResource};
use vocara_core::Error;

use crate::api::audio_generation::{delete_job_and_blob, load_owned, parse_job_id};
use crate::api::authenticate;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    #[serde(default)]
    pub text: Option<String>,
    pub avatar_id: String,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub input_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    #[serde(rename = "taskId")]
    pub task_id: Uuid,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(rename = "taskId")]
    pub task_id: Uuid,
    pub status: &'static str,
    pub progress: u8,
    pub video_url: Option<String>,
    pub error_message: Option<String>,
    pub created_at: u64,
}

pub async fn generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let owner_id = authenticate(&state, &headers).await?;

    let input = match req.input_type.as_deref().map(str::trim) {
        None | Some("") | Some("script") => JobInput::Script,
        Some("audio") => JobInput::Audio,
        Some(other) => {
            return Err(ApiError::bad_request(format!(
                "invalid `inputType` `{other}`; expected `script` or `audio`"
            )))
        }
    };

    let quality = match req.quality.as_deref() {
        None => JobQuality::Fast,
        Some(raw) => JobQuality::parse(raw).ok_or_else(|| {
            ApiError::bad_request(format!(
                "invalid `quality` `{raw}`; expected `fast`, `high`, or `standard`"
            ))
        })?,
    };

    let text = req.text.as_deref().map(str::trim).filter(|t| !t.is_empty());
    let audio_url = req
        .audio_url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty());
    match input {
        JobInput::Script if text.is_none() => {
            return Err(ApiError::bad_request("`text` is required for script jobs"))
        }
        JobInput::Audio if audio_url.is_none() => {
            return Err(ApiError::bad_request(
                "`audioUrl` is required for audio jobs",
            ))
        }
        _ => {}
    }

    let avatar = state
        .avatars
        .get(req.avatar_id.trim())
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found("Avatar not found"))?;

    let predicted = estimated_video_minutes(text);
    if let Admission::Denied { used, limit } = state
        .usage
        .check(&owner_id, UsageResource::VideoMinutes, predicted)
        .await
        .map_err(ApiError::from)?
    {
        return Err(Error::QuotaExceeded {
            resource: UsageResource::VideoMinutes,
            used,
            limit,
        }
        .into());
    }

    let job = state
        .jobs
        .create(NewJob {
            owner_id,
            avatar_id: avatar.id,
            kind: JobKind::Video,
            input,
            script_text: text.map(str::to_string),
            source_audio_url: audio_url.map(str::to_string),
            quality,
            language: avatar.language.unwrap_or_else(|| "en".to_string()),
        })
        .await
        .map_err(ApiError::from)?;

    if let Err(err) = state.scheduler.submit(job.id) {
        state.jobs.fail(job.id, &err).await;
        return Err(err.into());
    }

    Ok(Json(GenerateResponse {
        task_id: job.id,
        status: "queued",
    }))
}

pub async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let owner_id = authenticate(&state, &headers).await?;
    let job = load_owned(&state, &task_id, &owner_id).await?;

    Ok(Json(StatusResponse {
        task_id: job.id,
        status: job.status.as_db_value(),
        progress: job.progress,
        video_url: job.result_url,
        error_message: job.error_message,
        created_at: job.created_at_ms,
    }))
}

pub async fn remove(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<super::audio_generation::DeleteResponse>, ApiError> {
    let owner_id = authenticate(&state, &headers).await?;
    let job_id = parse_job_id(&id)?;

    delete_job_and_blob(&state, job_id, &owner_id).await?;
    Ok(Json(super::audio_generation::DeleteResponse {
        id: job_id,
        deleted: true,
    }))
}
