//! Application state: explicitly constructed services, no globals.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use vocara_core::avatar::AvatarCache;
use vocara_core::clients::{
    ChatModel, HttpChatClient, HttpVideoClient, HttpVoiceClient, RemoteTokenVerifier,
    TokenVerifier, VideoRender, VoiceSynth,
};
use vocara_core::config::Settings;
use vocara_core::db::{Database, RestDatabase};
use vocara_core::error::{Error, Result};
use vocara_core::jobs::{
    spawn_reaper, AudioJobRunner, DispatchRunner, JobScheduler, JobStore, PipelineDeps,
    VideoJobRunner,
};
use vocara_core::object_store::{ObjectStore, RestObjectStore};
use vocara_core::usage::UsageAccountant;

/// Backend services the state is assembled from. Production wires the
/// REST clients; tests hand in the in-memory doubles.
pub struct Services {
    pub settings: Settings,
    pub db: Arc<dyn Database>,
    pub storage: Arc<dyn ObjectStore>,
    pub voice: Arc<dyn VoiceSynth>,
    pub video: Arc<dyn VideoRender>,
    pub chat: Arc<dyn ChatModel>,
    pub verifier: Arc<dyn TokenVerifier>,
}

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub db: Arc<dyn Database>,
    pub storage: Arc<dyn ObjectStore>,
    pub voice: Arc<dyn VoiceSynth>,
    pub video: Arc<dyn VideoRender>,
    pub chat: Arc<dyn ChatModel>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub avatars: Arc<AvatarCache>,
    pub jobs: JobStore,
    pub usage: Arc<UsageAccountant>,
    pub scheduler: Arc<JobScheduler>,
    /// Root signal for background tasks (reaper); cancelled at shutdown.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Build the production state from environment-derived settings.
    pub fn from_settings(settings: Settings) -> anyhow::Result<Self> {
        let db: Arc<dyn Database> = Arc::new(RestDatabase::new(&settings.database)?);
        let storage: Arc<dyn ObjectStore> = Arc::new(RestObjectStore::new(&settings.storage)?);
        let voice: Arc<dyn VoiceSynth> = Arc::new(HttpVoiceClient::new(&settings.voice)?);
        let video: Arc<dyn VideoRender> = Arc::new(HttpVideoClient::new(&settings.video)?);
        let chat: Arc<dyn ChatModel> = Arc::new(HttpChatClient::new(&settings.llm)?);

        let verifier: Arc<dyn TokenVerifier> = match settings.auth_verify_url.clone() {
            Some(url) => Arc::new(RemoteTokenVerifier::new(url)?),
            None => {
                warn!("AUTH_VERIFY_URL is not set; accepting bearer tokens as user ids");
                Arc::new(InsecureDevVerifier)
            }
        };

        Ok(Self::new(Services {
            settings,
            db,
            storage,
            voice,
            video,
            chat,
            verifier,
        }))
    }

    /// Assemble the state and start the job scheduler and reaper.
    pub fn new(services: Services) -> Self {
        let settings = Arc::new(services.settings);
        let avatars = Arc::new(AvatarCache::new(services.db.clone()));
        let usage = Arc::new(UsageAccountant::new(services.db.clone()));
        let jobs = JobStore::new(services.db.clone());

        let deps = PipelineDeps {
            store: jobs.clone(),
            avatars: avatars.clone(),
            voice: services.voice.clone(),
            video: services.video.clone(),
            storage: services.storage.clone(),
            usage: usage.clone(),
        };
        let runner = DispatchRunner::new(
            AudioJobRunner::new(deps.clone(), settings.chunk_pause),
            VideoJobRunner::new(deps, settings.completion_source),
        );
        let scheduler = Arc::new(JobScheduler::start(
            jobs.clone(),
            Arc::new(runner),
            settings.max_concurrent_jobs,
            settings.queue_capacity,
        ));

        let shutdown = CancellationToken::new();
        spawn_reaper(jobs.clone(), services.db.clone(), shutdown.child_token());

        Self {
            settings,
            db: services.db,
            storage: services.storage,
            voice: services.voice,
            video: services.video,
            chat: services.chat,
            verifier: services.verifier,
            avatars,
            jobs,
            usage,
            scheduler,
            shutdown,
        }
    }

    /// Stop background work: no new jobs, cancel in-flight runners, stop
    /// the reaper.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.scheduler.shutdown().await;
    }
}

/// Development fallback when no auth provider is configured: the bearer
/// token is taken verbatim as the user id.
struct InsecureDevVerifier;

#[async_trait]
impl TokenVerifier for InsecureDevVerifier {
    async fn verify(&self, bearer: &str) -> Result<String> {
        let token = bearer.trim();
        if token.is_empty() {
            return Err(Error::Unauthorized);
        }
        Ok(token.to_string())
    }
}
