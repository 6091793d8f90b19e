//! Speech-generation pipeline: chunk, synthesize, concatenate, upload.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::chunker::{self, DEFAULT_TOKEN_CAP};
use crate::clients::SynthesisRequest;
use crate::error::{Error, Result};
use crate::job::GenerationJob;
use crate::jobs::PipelineDeps;
use crate::object_store::keys;
use crate::time_ms;
use crate::usage::{estimated_audio_minutes, UsageResource};
use crate::wav;

pub struct AudioJobRunner {
    deps: PipelineDeps,
    /// Pause between per-chunk synthesis calls; the voice service throttles
    /// rapid-fire clone requests.
    chunk_pause: Duration,
    token_cap: usize,
}

impl AudioJobRunner {
    pub fn new(deps: PipelineDeps, chunk_pause: Duration) -> Self {
        Self {
            deps,
            chunk_pause,
            token_cap: DEFAULT_TOKEN_CAP,
        }
    }

    pub async fn run_job(&self, job: GenerationJob, cancel: CancellationToken) -> Result<()> {
        let avatar = self
            .deps
            .avatars
            .get(&job.avatar_id)
            .await?
            .ok_or(Error::AvatarNotFound)?;
        self.deps.store.set_progress(job.id, 10).await?;

        let text = job
            .script_text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::validation("text", "audio jobs require script text"))?;

        let plan = chunker::plan(text, self.token_cap);
        if plan.is_empty() {
            return Err(Error::validation("text", "script contains nothing to speak"));
        }
        self.deps.store.set_progress(job.id, 20).await?;
        debug!(job_id = %job.id, chunks = plan.len(), "audio synthesis plan ready");

        let total = plan.len();
        let mut pieces = Vec::with_capacity(total);
        for (index, fragment) in plan.fragments.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::ShutdownAborted);
            }

            let audio = self
                .deps
                .voice
                .synthesize(&SynthesisRequest {
                    voice_id: avatar.id.clone(),
                    clone_ref: avatar.voice_sample_url.clone(),
                    text: fragment.clone(),
                    language: job.language.clone(),
                })
                .await
                .map_err(|err| Error::VoiceSynthFailed {
                    chunk_index: index,
                    detail: err.to_string(),
                })?;
            if audio.is_empty() {
                return Err(Error::VoiceSynthFailed {
                    chunk_index: index,
                    detail: "voice service returned an empty body".into(),
                });
            }
            pieces.push(audio);

            // 20..=70, linear in completed chunks.
            let progress = 20 + ((50 * (index + 1)) / total) as u8;
            self.deps.store.set_progress(job.id, progress).await?;

            if index + 1 < total && !self.chunk_pause.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.chunk_pause) => {}
                    _ = cancel.cancelled() => return Err(Error::ShutdownAborted),
                }
            }
        }

        let merged = wav::concat(&pieces)?;
        self.deps.store.set_progress(job.id, 80).await?;

        let key = keys::generated_audio(&job.owner_id, job.id, time_ms());
        let url = self.deps.storage.put(&key, merged, "audio/wav").await?;
        self.deps.store.set_progress(job.id, 90).await?;

        self.deps
            .usage
            .commit(
                &job.owner_id,
                UsageResource::AudioMinutes,
                estimated_audio_minutes(text),
            )
            .await;
        self.deps.store.set_progress(job.id, 95).await?;

        self.deps.store.complete(job.id, url).await?;
        Ok(())
    }
}
