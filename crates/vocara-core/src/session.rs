//! Live-conversation records persisted when a session closes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Voice,
    Video,
}

impl SessionKind {
    pub const fn as_db_value(self) -> &'static str {
        match self {
            Self::Voice => "voice",
            Self::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptRole {
    User,
    Model,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: TranscriptRole,
    pub text: String,
}

/// The durable trace of one conversation, written once at teardown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub owner_id: String,
    pub avatar_id: String,
    pub kind: SessionKind,
    pub language: String,
    pub started_at_ms: u64,
    pub ended_at_ms: u64,
    pub transcript: Vec<TranscriptEntry>,
}
