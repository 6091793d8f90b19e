//! Per-user monthly usage counters and the admission/commit accountant.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::db::Database;
use crate::error::Result;
use crate::time_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageResource {
    AudioMinutes,
    VideoMinutes,
    ConversationMinutes,
    AvatarCreations,
    ApiCalls,
}

impl UsageResource {
    pub const fn as_db_value(self) -> &'static str {
        match self {
            Self::AudioMinutes => "audio_minutes",
            Self::VideoMinutes => "video_minutes",
            Self::ConversationMinutes => "conversation_minutes",
            Self::AvatarCreations => "avatar_creations",
            Self::ApiCalls => "api_calls",
        }
    }

    /// Free-tier allowance seeded when a user has no counter row yet.
    pub const fn default_limit(self) -> f64 {
        match self {
            Self::AudioMinutes => 60.0,
            Self::VideoMinutes => 30.0,
            Self::ConversationMinutes => 120.0,
            Self::AvatarCreations => 5.0,
            Self::ApiCalls => 10_000.0,
        }
    }
}

impl fmt::Display for UsageResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_value())
    }
}

/// One per-user per-resource accumulator for the current billing cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageCounter {
    pub owner_id: String,
    pub resource: UsageResource,
    pub used: f64,
    pub limit: f64,
    pub cycle_start_ms: u64,
}

impl UsageCounter {
    pub fn seeded(owner_id: &str, resource: UsageResource) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            resource,
            used: 0.0,
            limit: resource.default_limit(),
            cycle_start_ms: time_ms(),
        }
    }

    pub fn remaining(&self) -> f64 {
        (self.limit - self.used).max(0.0)
    }
}

/// Outcome of a pre-flight admission check, carrying the pre-image so
/// callers can render `{used, limit, remaining}` without a second read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Granted { used: f64, limit: f64 },
    Denied { used: f64, limit: f64 },
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }
}

/// Reads and increments usage counters.
///
/// `commit` is read-modify-write on the hosted row and is not transactional
/// across concurrent jobs; a brief over-count under contention is accepted.
pub struct UsageAccountant {
    db: Arc<dyn Database>,
}

impl UsageAccountant {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub async fn check(
        &self,
        owner_id: &str,
        resource: UsageResource,
        requested: f64,
    ) -> Result<Admission> {
        let counter = self.load(owner_id, resource).await?;
        let admission = if counter.used + requested <= counter.limit {
            Admission::Granted {
                used: counter.used,
                limit: counter.limit,
            }
        } else {
            Admission::Denied {
                used: counter.used,
                limit: counter.limit,
            }
        };
        Ok(admission)
    }

    /// Adds `amount` to the counter. Persistence failures are logged and
    /// swallowed: a lost increment must never fail the job or session that
    /// produced it.
    pub async fn commit(&self, owner_id: &str, resource: UsageResource, amount: f64) {
        if amount <= 0.0 {
            return;
        }

        let result = async {
            let mut counter = self.load(owner_id, resource).await?;
            counter.used += amount;
            self.db.upsert_usage(&counter).await
        }
        .await;

        if let Err(err) = result {
            warn!(
                owner_id,
                resource = %resource,
                amount,
                "failed to persist usage commit: {err}"
            );
        }
    }

    async fn load(&self, owner_id: &str, resource: UsageResource) -> Result<UsageCounter> {
        match self.db.fetch_usage(owner_id, resource).await? {
            Some(counter) => Ok(counter),
            None => {
                let counter = UsageCounter::seeded(owner_id, resource);
                self.db.upsert_usage(&counter).await?;
                Ok(counter)
            }
        }
    }
}

/// Predicted audio minutes for a script: reading pace of 150 words per
/// minute with a half-minute floor.
pub fn estimated_audio_minutes(text: &str) -> f64 {
    let words = text.split_whitespace().count() as f64;
    (words / 150.0).max(0.5)
}

/// Predicted video minutes for a script; the empty script (pre-recorded
/// audio input) charges the floor.
pub fn estimated_video_minutes(text: Option<&str>) -> f64 {
    let chars = text.map(|t| t.chars().count()).unwrap_or(0) as f64;
    (chars * 0.01).max(0.5)
}
