//! Error kinds shared across the control plane.
//!
//! Handlers map these onto HTTP statuses; runners store the rendered
//! message on the failed job row, so `Display` output is user-visible.

use thiserror::Error;

use crate::avatar::AvatarAsset;
use crate::usage::UsageResource;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid `{field}`: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error("{resource} quota exceeded: used {used:.2} of {limit:.2}")]
    QuotaExceeded {
        resource: UsageResource,
        used: f64,
        limit: f64,
    },

    #[error("avatar not found")]
    AvatarNotFound,

    #[error("avatar is missing its {missing} asset")]
    AvatarIncomplete { missing: AvatarAsset },

    #[error("{service} service is unreachable: {reason}")]
    UpstreamUnavailable {
        service: &'static str,
        reason: String,
    },

    #[error("{service} service rejected the request: {body}")]
    UpstreamRejected { service: &'static str, body: String },

    #[error("voice synthesis failed on chunk {chunk_index}: {detail}")]
    VoiceSynthFailed { chunk_index: usize, detail: String },

    #[error("video enqueue failed: {0}")]
    VideoEnqueueFailed(String),

    #[error("video render did not finish within {attempts} poll attempts")]
    PollTimeout { attempts: u32 },

    #[error("audio assembly failed: {0}")]
    AssembleFailed(String),

    #[error("storage upload failed for `{key}`: {reason}")]
    StorageUploadFailed { key: String, reason: String },

    #[error("store error: {0}")]
    StoreError(String),

    #[error("job queue is full")]
    QueueFull,

    #[error("worker callback authentication failed")]
    WorkerAuthFailed,

    #[error("job aborted by server shutdown")]
    ShutdownAborted,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn store(reason: impl Into<String>) -> Self {
        Self::StoreError(reason.into())
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal(reason.into())
    }

    /// Whether a retry of the same operation could plausibly succeed.
    /// Poll loops use this to distinguish transient upstream hiccups from
    /// hard rejections.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable { .. })
    }
}
