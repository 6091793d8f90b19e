//! Inbound completion endpoint for the out-of-process GPU worker.

use axum::extract::{Multipart, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use vocara_core::job::{JobStatus, JobUpdate};
use vocara_core::object_store::keys;
use vocara_core::time_ms;
use vocara_core::usage::{estimated_video_minutes, UsageResource};

use crate::error::ApiError;
use crate::state::AppState;

const MAX_FILE_BYTES: usize = 300 * 1024 * 1024;

const WORKER_TOKEN_HEADER: &str = "x-worker-token";

pub async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Response {
    if !is_authorized(&state, &headers) {
        // Auth failures answer 401 with an empty body.
        return StatusCode::UNAUTHORIZED.into_response();
    }

    match handle(&state, multipart).await {
        Ok(body) => Json(body).into_response(),
        Err(err) => err.into_response(),
    }
}

fn is_authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let expected = state.settings.worker_callback_token.as_str();
    if expected.is_empty() {
        return false;
    }

    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);
    let dedicated = headers
        .get(WORKER_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim);

    bearer == Some(expected) || dedicated == Some(expected)
}

async fn handle(state: &AppState, mut multipart: Multipart) -> Result<serde_json::Value, ApiError> {
    let mut task_id: Option<String> = None;
    let mut status: Option<String> = None;
    let mut error_text: Option<String> = None;
    let mut file: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("malformed multipart body: {err}")))?
    {
        match field.name().unwrap_or_default() {
            "task_id" => task_id = Some(read_text(field).await?),
            "status" => status = Some(read_text(field).await?),
            "error" => error_text = Some(read_text(field).await?),
            "file" => {
                let bytes = field.bytes().await.map_err(|err| {
                    ApiError::bad_request(format!("failed reading file part: {err}"))
                })?;
                if bytes.len() > MAX_FILE_BYTES {
                    return Err(ApiError::bad_request("file part exceeds 300 MiB"));
                }
                file = Some(bytes.to_vec());
            }
            _ => {}
        }
    }

    let task_id = task_id.ok_or_else(|| ApiError::bad_request("`task_id` field is required"))?;
    let status = status.ok_or_else(|| ApiError::bad_request("`status` field is required"))?;
    let job_id = Uuid::parse_str(task_id.trim())
        .map_err(|_| ApiError::bad_request("`task_id` is not a valid job id"))?;

    let job = state
        .jobs
        .get(job_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found("unknown task id"))?;

    // Repeated deliveries after the job settled are acknowledged without
    // touching the row or uploading anything.
    if job.status.is_terminal() {
        return Ok(json!({
            "taskId": job.id,
            "status": job.status.as_db_value(),
            "changed": false,
        }));
    }

    match status.trim() {
        "processing" => {
            state
                .jobs
                .set_progress(job_id, 70)
                .await
                .map_err(ApiError::from)?;
            Ok(json!({ "taskId": job_id, "status": "processing", "changed": true }))
        }
        "failed" => {
            let reason = error_text
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| "worker reported failure".to_string());
            state
                .jobs
                .try_transition(
                    job_id,
                    JobStatus::Failed,
                    JobUpdate {
                        progress: Some(0),
                        error_message: Some(reason),
                        ..JobUpdate::default()
                    },
                )
                .await
                .map_err(ApiError::from)?;
            Ok(json!({ "taskId": job_id, "status": "failed", "changed": true }))
        }
        "completed" => {
            let bytes = file.ok_or_else(|| {
                ApiError::bad_request("`file` part is required for completed deliveries")
            })?;
            complete(state, &job, bytes).await
        }
        other => Err(ApiError::bad_request(format!(
            "invalid `status` `{other}`; expected processing, completed, or failed"
        ))),
    }
}

async fn complete(
    state: &AppState,
    job: &vocara_core::job::GenerationJob,
    bytes: Vec<u8>,
) -> Result<serde_json::Value, ApiError> {
    let key = keys::callback_video(job.id, time_ms());
    let url = match state.storage.put(&key, bytes, "video/mp4").await {
        Ok(url) => url,
        Err(err) => {
            state.jobs.fail(job.id, &err).await;
            return Err(err.into());
        }
    };

    let won = state
        .jobs
        .try_transition(
            job.id,
            JobStatus::Completed,
            JobUpdate {
                progress: Some(100),
                result_url: Some(url.clone()),
                ..JobUpdate::default()
            },
        )
        .await
        .map_err(ApiError::from)?;

    if won {
        state
            .usage
            .commit(
                &job.owner_id,
                UsageResource::VideoMinutes,
                estimated_video_minutes(job.script_text.as_deref()),
            )
            .await;
        info!(job_id = %job.id, "worker callback completed job");
    }

    Ok(json!({
        "taskId": job.id,
        "status": "completed",
        "video_url": url,
        "changed": won,
    }))
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|err| ApiError::bad_request(format!("malformed multipart field: {err}")))
}
