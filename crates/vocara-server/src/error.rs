//! HTTP error rendering.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use vocara_core::Error;

/// JSON error envelope with the status it renders at.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: serde_json::Value,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: json!({ "error": message.into() }),
        }
    }

    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            body: json!({ "error": "unauthorized" }),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            body: json!({ "error": message.into() }),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: json!({ "error": message.into() }),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation { .. } | Error::AvatarIncomplete { .. } => {
                Self::bad_request(err.to_string())
            }
            Error::Unauthorized | Error::WorkerAuthFailed => Self::unauthorized(),
            Error::QuotaExceeded {
                resource,
                used,
                limit,
            } => Self {
                status: StatusCode::FORBIDDEN,
                body: json!({
                    "error": format!("{resource} quota exceeded"),
                    "resource": resource.as_db_value(),
                    "used": used,
                    "limit": limit,
                    "remaining": (limit - used).max(0.0),
                }),
            },
            Error::AvatarNotFound => Self::not_found("Avatar not found"),
            Error::QueueFull => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                body: json!({ "error": "job queue is full, try again shortly" }),
            },
            other => Self::internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
