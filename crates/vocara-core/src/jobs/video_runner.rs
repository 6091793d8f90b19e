//! Talking-head video pipeline: synth speech, enqueue the render, then
//! drive completion by polling or by waiting for the worker callback.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::avatar::AvatarAsset;
use crate::clients::{PollReply, SynthesisRequest};
use crate::config::CompletionSource;
use crate::error::{Error, Result};
use crate::job::{GenerationJob, JobInput, JobStatus, JobUpdate};
use crate::jobs::PipelineDeps;
use crate::object_store::keys;
use crate::time_ms;
use crate::usage::{estimated_video_minutes, UsageResource};

pub struct VideoJobRunner {
    deps: PipelineDeps,
    completion: CompletionSource,
    /// Test hook; production cadence comes from the job's quality.
    poll_interval_override: Option<Duration>,
}

impl VideoJobRunner {
    pub fn new(deps: PipelineDeps, completion: CompletionSource) -> Self {
        Self {
            deps,
            completion,
            poll_interval_override: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_override = Some(interval);
        self
    }

    pub async fn run_job(&self, job: GenerationJob, cancel: CancellationToken) -> Result<()> {
        let avatar = self
            .deps
            .avatars
            .get(&job.avatar_id)
            .await?
            .ok_or(Error::AvatarNotFound)?;
        let image_url = avatar.image_url.clone().ok_or(Error::AvatarIncomplete {
            missing: AvatarAsset::Image,
        })?;

        let mut temp_key = None;
        let audio_url = match job.input {
            JobInput::Script => {
                let text = job
                    .script_text
                    .as_deref()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| Error::validation("text", "script jobs require text"))?;
                let clone_ref =
                    avatar
                        .voice_sample_url
                        .clone()
                        .ok_or(Error::AvatarIncomplete {
                            missing: AvatarAsset::Voice,
                        })?;

                // The whole script goes through one synthesis call; video
                // lip-sync wants a single continuous track.
                let audio = self
                    .deps
                    .voice
                    .synthesize(&SynthesisRequest {
                        voice_id: avatar.id.clone(),
                        clone_ref: Some(clone_ref),
                        text: text.to_string(),
                        language: job.language.clone(),
                    })
                    .await?;
                if audio.is_empty() {
                    return Err(Error::VoiceSynthFailed {
                        chunk_index: 0,
                        detail: "voice service returned an empty body".into(),
                    });
                }

                let key = keys::temp_audio(&job.owner_id, job.id, time_ms());
                let url = self.deps.storage.put(&key, audio, "audio/wav").await?;
                temp_key = Some(key);

                self.deps
                    .store
                    .update_fields(
                        job.id,
                        JobUpdate {
                            source_audio_url: Some(url.clone()),
                            ..JobUpdate::default()
                        },
                    )
                    .await?;
                self.deps.store.set_progress(job.id, 50).await?;
                url
            }
            JobInput::Audio => job
                .source_audio_url
                .clone()
                .ok_or_else(|| Error::validation("audioUrl", "audio jobs require a source URL"))?,
        };

        let result = self.render(&job, &image_url, &audio_url, &cancel).await;

        // The temp synth blob goes away on every exit path.
        if let Some(key) = temp_key {
            if let Err(err) = self.deps.storage.delete(&key).await {
                warn!(job_id = %job.id, "failed to remove temp audio `{key}`: {err}");
            }
        }

        result
    }

    async fn render(
        &self,
        job: &GenerationJob,
        image_url: &str,
        audio_url: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let task_id = self
            .deps
            .video
            .enqueue(image_url, audio_url, job.quality)
            .await
            .map_err(|err| match err {
                err @ Error::VideoEnqueueFailed(_) => err,
                other => Error::VideoEnqueueFailed(other.to_string()),
            })?;
        debug!(job_id = %job.id, task_id, "video render enqueued");

        self.deps
            .store
            .update_fields(
                job.id,
                JobUpdate {
                    upstream_task_id: Some(task_id.clone()),
                    ..JobUpdate::default()
                },
            )
            .await?;
        self.deps.store.set_progress(job.id, 70).await?;

        match self.completion {
            // The GPU worker pushes the artifact to /worker/callback; the
            // row stays `processing` and the reaper bounds the wait.
            CompletionSource::Callback => Ok(()),
            CompletionSource::Poll => self.poll(job, &task_id, cancel).await,
        }
    }

    async fn poll(
        &self,
        job: &GenerationJob,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let interval = self
            .poll_interval_override
            .unwrap_or_else(|| job.quality.poll_interval());
        let attempts = job.quality.max_poll_attempts();

        // Only the error observed on the final attempt is persisted;
        // everything before that is retried silently.
        let mut last_attempt_error: Option<Error> = None;

        for _ in 0..attempts {
            if !interval.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => return Err(Error::ShutdownAborted),
                }
            } else if cancel.is_cancelled() {
                return Err(Error::ShutdownAborted);
            }

            match self.deps.video.status(task_id).await {
                // A 200 with an empty mp4 body is an upstream flush bug,
                // not a finished artifact.
                Ok(PollReply::Ready(bytes)) if bytes.is_empty() => {
                    last_attempt_error = None;
                }
                Ok(PollReply::Ready(bytes)) => {
                    return self.finish(job, bytes).await;
                }
                Ok(PollReply::Processing) | Ok(PollReply::NotFound) => {
                    last_attempt_error = None;
                }
                Ok(PollReply::Failed(reason)) => {
                    return Err(Error::UpstreamRejected {
                        service: "video",
                        body: reason,
                    });
                }
                Err(err) if err.is_transient() => {
                    last_attempt_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_attempt_error.unwrap_or(Error::PollTimeout { attempts }))
    }

    async fn finish(&self, job: &GenerationJob, bytes: Vec<u8>) -> Result<()> {
        let key = keys::generated_video(job.id, job.quality, time_ms());
        let url = self.deps.storage.put(&key, bytes, "video/mp4").await?;

        // If the worker callback raced us to the terminal state this is a
        // no-op and the minutes were already billed there.
        let won = self
            .deps
            .store
            .try_transition(
                job.id,
                JobStatus::Completed,
                JobUpdate {
                    progress: Some(100),
                    result_url: Some(url),
                    ..JobUpdate::default()
                },
            )
            .await?;
        if won {
            self.deps
                .usage
                .commit(
                    &job.owner_id,
                    UsageResource::VideoMinutes,
                    estimated_video_minutes(job.script_text.as_deref()),
                )
                .await;
        }
        Ok(())
    }
}
