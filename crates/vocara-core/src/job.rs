//! Generation-job rows and their state machine.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Audio,
    Video,
}

impl JobKind {
    pub const fn as_db_value(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// How the job sources its speech track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobInput {
    /// Synthesize speech from `script_text`.
    Script,
    /// Use a pre-recorded clip at `source_audio_url`.
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobQuality {
    Fast,
    High,
}

impl JobQuality {
    /// The wire surface historically accepted `standard`; it maps onto the
    /// high-quality model.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fast" => Some(Self::Fast),
            "high" | "standard" => Some(Self::High),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::High => "high",
        }
    }

    /// Cadence of the video-service status poll.
    pub const fn poll_interval(self) -> Duration {
        match self {
            Self::Fast => Duration::from_millis(3_000),
            Self::High => Duration::from_millis(5_000),
        }
    }

    /// Poll attempt ceiling; together with [`Self::poll_interval`] this
    /// bounds the render window at roughly 6 and 20 minutes.
    pub const fn max_poll_attempts(self) -> u32 {
        match self {
            Self::Fast => 120,
            Self::High => 240,
        }
    }

    /// How long a `processing` row may sit before the reaper reclaims it.
    pub const fn processing_timeout(self) -> Duration {
        match self {
            Self::Fast => Duration::from_secs(6 * 60),
            Self::High => Duration::from_secs(20 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub const fn as_db_value(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    /// Legal transitions. Terminal states have no exits; everything else
    /// is validated here so an illegal write fails loudly in the store.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Processing)
                | (Self::Queued, Self::Failed)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
                | (Self::Processing, Self::TimedOut)
        )
    }
}

/// One asynchronous generation request, persisted for its whole life.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: Uuid,
    pub owner_id: String,
    pub avatar_id: String,
    pub kind: JobKind,
    pub input: JobInput,
    #[serde(default)]
    pub script_text: Option<String>,
    #[serde(default)]
    pub source_audio_url: Option<String>,
    pub quality: JobQuality,
    pub language: String,
    #[serde(default)]
    pub upstream_task_id: Option<String>,
    #[serde(default)]
    pub result_url: Option<String>,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at_ms: u64,
    #[serde(default)]
    pub completed_at_ms: Option<u64>,
}

/// Parameters for a new row; everything else is seeded by the store.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub owner_id: String,
    pub avatar_id: String,
    pub kind: JobKind,
    pub input: JobInput,
    pub script_text: Option<String>,
    pub source_audio_url: Option<String>,
    pub quality: JobQuality,
    pub language: String,
}

/// Field-selective update; `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub result_url: Option<String>,
    pub error_message: Option<String>,
    pub upstream_task_id: Option<String>,
    pub source_audio_url: Option<String>,
    pub completed_at_ms: Option<u64>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }
}
