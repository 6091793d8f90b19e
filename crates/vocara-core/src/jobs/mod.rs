//! Asynchronous generation jobs: store, scheduler, and the per-kind
//! pipeline runners.

pub mod audio_runner;
pub mod reaper;
pub mod scheduler;
pub mod store;
pub mod video_runner;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::avatar::AvatarCache;
use crate::clients::{VideoRender, VoiceSynth};
use crate::error::Result;
use crate::job::{GenerationJob, JobKind};
use crate::object_store::ObjectStore;
use crate::usage::UsageAccountant;

pub use audio_runner::AudioJobRunner;
pub use reaper::spawn_reaper;
pub use scheduler::{JobRunner, JobScheduler};
pub use store::JobStore;
pub use video_runner::VideoJobRunner;

/// Services shared by both pipelines.
#[derive(Clone)]
pub struct PipelineDeps {
    pub store: JobStore,
    pub avatars: Arc<AvatarCache>,
    pub voice: Arc<dyn VoiceSynth>,
    pub video: Arc<dyn VideoRender>,
    pub storage: Arc<dyn ObjectStore>,
    pub usage: Arc<UsageAccountant>,
}

/// Routes a dispatched job to the pipeline for its kind.
pub struct DispatchRunner {
    audio: AudioJobRunner,
    video: VideoJobRunner,
}

impl DispatchRunner {
    pub fn new(audio: AudioJobRunner, video: VideoJobRunner) -> Self {
        Self { audio, video }
    }
}

#[async_trait]
impl JobRunner for DispatchRunner {
    async fn run(&self, job: GenerationJob, cancel: CancellationToken) -> Result<()> {
        match job.kind {
            JobKind::Audio => self.audio.run_job(job, cancel).await,
            JobKind::Video => self.video.run_job(job, cancel).await,
        }
    }
}
