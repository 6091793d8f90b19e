//! Speech-generation endpoints.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use vocara_core::job::{GenerationJob, JobInput, JobKind, JobQuality, JobStatus, NewJob};
use vocara_core::object_store::key_from_public_url;
use vocara_core::usage::{estimated_audio_minutes, Admission, UsageResource};
use vocara_core::Error;

use crate::api::authenticate;
use crate::error::ApiError;
use crate::state::AppState;

/// Script length cap on the audio surface.
const MAX_SCRIPT_CHARS: usize = 1_000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    #[serde(default)]
    pub text: Option<String>,
    pub voice_id: String,
    #[serde(default)]
    pub language: Option<String>,
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
    pub audio_url: Option<String>,
    pub error_message: Option<String>,
    pub created_at: u64,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub id: Uuid,
    pub deleted: bool,
}

pub async fn generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let owner_id = authenticate(&state, &headers).await?;

    let text = req
        .text
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::bad_request("`text` is required"))?;
    if text.chars().count() > MAX_SCRIPT_CHARS {
        return Err(ApiError::bad_request(format!(
            "`text` exceeds {MAX_SCRIPT_CHARS} characters"
        )));
    }

    let avatar = state
        .avatars
        .get(req.voice_id.trim())
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found("Avatar not found"))?;

    let predicted = estimated_audio_minutes(text);
    if let Admission::Denied { used, limit } = state
        .usage
        .check(&owner_id, UsageResource::AudioMinutes, predicted)
        .await
        .map_err(ApiError::from)?
    {
        return Err(Error::QuotaExceeded {
            resource: UsageResource::AudioMinutes,
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
            kind: JobKind::Audio,
            input: JobInput::Script,
            script_text: Some(text.to_string()),
            source_audio_url: None,
            quality: JobQuality::Fast,
            language: req
                .language
                .or(avatar.language)
                .unwrap_or_else(|| "en".to_string()),
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
        progress: derived_progress(&job),
        audio_url: job.result_url,
        error_message: job.error_message,
        created_at: job.created_at_ms,
    }))
}

pub async fn remove(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let owner_id = authenticate(&state, &headers).await?;
    let job_id = parse_job_id(&id)?;

    delete_job_and_blob(&state, job_id, &owner_id).await?;
    Ok(Json(DeleteResponse {
        id: job_id,
        deleted: true,
    }))
}

/// Early rows predate per-step progress reporting; derive a coarse value
/// from the status when the column is still zero.
fn derived_progress(job: &GenerationJob) -> u8 {
    if job.progress > 0 {
        return job.progress;
    }
    match job.status {
        JobStatus::Queued => 10,
        JobStatus::Processing => 50,
        JobStatus::Completed => 100,
        JobStatus::Failed | JobStatus::TimedOut => 0,
    }
}

pub(crate) fn parse_job_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim()).map_err(|_| ApiError::bad_request("invalid job id"))
}

pub(crate) async fn load_owned(
    state: &AppState,
    raw_id: &str,
    owner_id: &str,
) -> Result<GenerationJob, ApiError> {
    let job_id = parse_job_id(raw_id)?;
    state
        .jobs
        .get(job_id)
        .await
        .map_err(ApiError::from)?
        .filter(|job| job.owner_id == owner_id)
        .ok_or_else(|| ApiError::not_found("Job not found"))
}

/// Blob first, then the row; a blob failure is logged but never blocks
/// the row deletion. Deleting an absent row is a success.
pub(crate) async fn delete_job_and_blob(
    state: &AppState,
    job_id: Uuid,
    owner_id: &str,
) -> Result<(), ApiError> {
    let job = state
        .jobs
        .get(job_id)
        .await
        .map_err(ApiError::from)?
        .filter(|job| job.owner_id == owner_id);

    if let Some(job) = job {
        if let Some(key) = job.result_url.as_deref().and_then(key_from_public_url) {
            if let Err(err) = state.storage.delete(key).await {
                warn!(%job_id, "failed to delete result blob `{key}`: {err}");
            }
        }
        state
            .jobs
            .delete(job_id, owner_id)
            .await
            .map_err(ApiError::from)?;
    }
    Ok(())
}
