//! In-memory backends and scripted upstream doubles.
//!
//! `MemoryDatabase` and `MemoryObjectStore` also back local development
//! when no hosted-store credentials are configured; the scripted clients
//! exist purely for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::avatar::{Avatar, AvatarCache};
use crate::clients::{
    ChatModel, PollReply, SynthesisRequest, TokenVerifier, VideoRender, VoiceSynth,
};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::job::{GenerationJob, JobKind, JobQuality, JobStatus, JobUpdate};
use crate::jobs::{JobStore, PipelineDeps};
use crate::object_store::ObjectStore;
use crate::session::SessionRecord;
use crate::usage::{UsageAccountant, UsageCounter, UsageResource};
use crate::wav::{self, WavFormat};

/// A small valid mono WAV payload for synth doubles.
pub fn tiny_wav(samples: usize) -> Vec<u8> {
    let pcm = vec![0u8; samples * 2];
    wav::from_pcm(
        &pcm,
        WavFormat {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
        },
    )
}

#[derive(Default)]
struct MemoryTables {
    avatars: HashMap<String, Avatar>,
    jobs: HashMap<Uuid, GenerationJob>,
    usage: HashMap<(String, UsageResource), UsageCounter>,
    sessions: Vec<SessionRecord>,
    fail_usage_writes: bool,
}

/// Hash-map backed [`Database`].
#[derive(Default)]
pub struct MemoryDatabase {
    tables: Mutex<MemoryTables>,
}

impl MemoryDatabase {
    pub async fn seed_avatar(&self, avatar: Avatar) {
        self.tables
            .lock()
            .await
            .avatars
            .insert(avatar.id.clone(), avatar);
    }

    pub async fn remove_avatar(&self, avatar_id: &str) {
        self.tables.lock().await.avatars.remove(avatar_id);
    }

    pub async fn seed_usage(&self, owner_id: &str, resource: UsageResource, used: f64, limit: f64) {
        self.tables.lock().await.usage.insert(
            (owner_id.to_string(), resource),
            UsageCounter {
                owner_id: owner_id.to_string(),
                resource,
                used,
                limit,
                cycle_start_ms: 0,
            },
        );
    }

    pub async fn fail_usage_writes(&self, fail: bool) {
        self.tables.lock().await.fail_usage_writes = fail;
    }

    pub async fn set_job_created_at(&self, job_id: Uuid, created_at_ms: u64) {
        if let Some(job) = self.tables.lock().await.jobs.get_mut(&job_id) {
            job.created_at_ms = created_at_ms;
        }
    }

    pub async fn sessions(&self) -> Vec<SessionRecord> {
        self.tables.lock().await.sessions.clone()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn fetch_avatar(&self, avatar_id: &str) -> Result<Option<Avatar>> {
        Ok(self.tables.lock().await.avatars.get(avatar_id).cloned())
    }

    async fn insert_job(&self, job: GenerationJob) -> Result<GenerationJob> {
        let mut tables = self.tables.lock().await;
        tables.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn fetch_job(&self, job_id: Uuid) -> Result<Option<GenerationJob>> {
        Ok(self.tables.lock().await.jobs.get(&job_id).cloned())
    }

    async fn update_job(&self, job_id: Uuid, update: &JobUpdate) -> Result<GenerationJob> {
        let mut tables = self.tables.lock().await;
        let job = tables
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| Error::store(format!("job {job_id} not found")))?;

        if let Some(status) = update.status {
            job.status = status;
        }
        if let Some(progress) = update.progress {
            job.progress = progress;
        }
        if let Some(result_url) = &update.result_url {
            job.result_url = Some(result_url.clone());
        }
        if let Some(error_message) = &update.error_message {
            job.error_message = Some(error_message.clone());
        }
        if let Some(task_id) = &update.upstream_task_id {
            job.upstream_task_id = Some(task_id.clone());
        }
        if let Some(audio_url) = &update.source_audio_url {
            job.source_audio_url = Some(audio_url.clone());
        }
        if let Some(completed_at) = update.completed_at_ms {
            job.completed_at_ms = Some(completed_at);
        }
        Ok(job.clone())
    }

    async fn list_jobs(
        &self,
        owner_id: &str,
        kind: JobKind,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<GenerationJob>> {
        let tables = self.tables.lock().await;
        let mut jobs: Vec<_> = tables
            .jobs
            .values()
            .filter(|j| j.owner_id == owner_id && j.kind == kind)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        Ok(jobs.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<GenerationJob>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect())
    }

    async fn delete_job(&self, job_id: Uuid, owner_id: &str) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.jobs.get(&job_id) {
            Some(job) if job.owner_id == owner_id => {
                tables.jobs.remove(&job_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fetch_usage(
        &self,
        owner_id: &str,
        resource: UsageResource,
    ) -> Result<Option<UsageCounter>> {
        Ok(self
            .tables
            .lock()
            .await
            .usage
            .get(&(owner_id.to_string(), resource))
            .cloned())
    }

    async fn upsert_usage(&self, counter: &UsageCounter) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if tables.fail_usage_writes {
            return Err(Error::store("usage writes disabled by test"));
        }
        tables.usage.insert(
            (counter.owner_id.clone(), counter.resource),
            counter.clone(),
        );
        Ok(())
    }

    async fn insert_session(&self, session: &SessionRecord) -> Result<()> {
        self.tables.lock().await.sessions.push(session.clone());
        Ok(())
    }

    async fn healthy(&self) -> bool {
        true
    }
}

/// Hash-map backed [`ObjectStore`] honoring the no-upsert rule.
#[derive(Default)]
pub struct MemoryObjectStore {
    blobs: Mutex<HashMap<String, (Vec<u8>, String)>>,
}

impl MemoryObjectStore {
    pub async fn contains_prefix(&self, prefix: &str) -> bool {
        self.blobs
            .lock()
            .await
            .keys()
            .any(|key| key.starts_with(prefix))
    }

    pub async fn keys(&self) -> Vec<String> {
        self.blobs.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.blobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.lock().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let mut blobs = self.blobs.lock().await;
        if blobs.contains_key(key) {
            return Err(Error::StorageUploadFailed {
                key: key.to_string(),
                reason: "key already exists".into(),
            });
        }
        blobs.insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(self.public_url(key))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .await
            .get(key)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| Error::store(format!("blob `{key}` not found")))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.blobs.lock().await.remove(key);
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        // Mirrors the hosted layout so `key_from_public_url` round-trips.
        format!("memory://vocara/storage/v1/object/public/avatar-media/{key}")
    }
}

/// Voice double. Without a script it hands back a small valid WAV for
/// every request; a script replaces the next responses in order.
#[derive(Default)]
pub struct ScriptedVoice {
    responses: Mutex<VecDeque<Result<Vec<u8>>>>,
    calls: Mutex<Vec<SynthesisRequest>>,
}

impl ScriptedVoice {
    pub async fn script(&self, responses: Vec<Result<Vec<u8>>>) {
        *self.responses.lock().await = responses.into();
    }

    pub async fn calls(&self) -> Vec<SynthesisRequest> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl VoiceSynth for ScriptedVoice {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>> {
        self.calls.lock().await.push(request.clone());
        match self.responses.lock().await.pop_front() {
            Some(response) => response,
            None => Ok(tiny_wav(320)),
        }
    }

    async fn healthy(&self) -> bool {
        true
    }
}

/// Video double recording enqueues and replaying scripted poll replies.
#[derive(Default)]
pub struct ScriptedVideo {
    statuses: Mutex<VecDeque<Result<PollReply>>>,
    enqueues: Mutex<Vec<(String, String, JobQuality)>>,
    streams: Mutex<Vec<String>>,
    fail_enqueue: Mutex<Option<String>>,
}

impl ScriptedVideo {
    pub async fn script_statuses(&self, statuses: Vec<Result<PollReply>>) {
        *self.statuses.lock().await = statuses.into();
    }

    pub async fn fail_enqueue_with(&self, reason: &str) {
        *self.fail_enqueue.lock().await = Some(reason.to_string());
    }

    pub async fn enqueues(&self) -> Vec<(String, String, JobQuality)> {
        self.enqueues.lock().await.clone()
    }

    pub async fn stream_calls(&self) -> Vec<String> {
        self.streams.lock().await.clone()
    }
}

#[async_trait]
impl VideoRender for ScriptedVideo {
    async fn enqueue(
        &self,
        image_url: &str,
        audio_url: &str,
        quality: JobQuality,
    ) -> Result<String> {
        if let Some(reason) = self.fail_enqueue.lock().await.clone() {
            return Err(Error::VideoEnqueueFailed(reason));
        }
        let mut enqueues = self.enqueues.lock().await;
        enqueues.push((image_url.to_string(), audio_url.to_string(), quality));
        Ok(format!("task-{}", enqueues.len()))
    }

    async fn status(&self, _task_id: &str) -> Result<PollReply> {
        match self.statuses.lock().await.pop_front() {
            Some(reply) => reply,
            None => Ok(PollReply::Processing),
        }
    }

    async fn init_stream(&self, session_id: &str, _image_url: &str) -> Result<()> {
        self.streams.lock().await.push(format!("init:{session_id}"));
        Ok(())
    }

    async fn end_stream(&self, session_id: &str) -> Result<()> {
        self.streams.lock().await.push(format!("end:{session_id}"));
        Ok(())
    }

    async fn healthy(&self) -> bool {
        true
    }
}

/// Chat double: echoes a canned reply or fails on demand.
#[derive(Default)]
pub struct ScriptedChat {
    fail: Mutex<bool>,
    turns: Mutex<Vec<(String, String)>>,
    forgotten: Mutex<Vec<String>>,
}

impl ScriptedChat {
    pub async fn fail_next_turns(&self, fail: bool) {
        *self.fail.lock().await = fail;
    }

    pub async fn turns(&self) -> Vec<(String, String)> {
        self.turns.lock().await.clone()
    }

    pub async fn forgotten(&self) -> Vec<String> {
        self.forgotten.lock().await.clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedChat {
    async fn generate(
        &self,
        session_id: &str,
        user_text: &str,
        _system_prompt: &str,
        _language: &str,
    ) -> Result<String> {
        if *self.fail.lock().await {
            return Err(Error::UpstreamUnavailable {
                service: "llm",
                reason: "scripted failure".into(),
            });
        }
        self.turns
            .lock()
            .await
            .push((session_id.to_string(), user_text.to_string()));
        Ok(format!("You said: {user_text}"))
    }

    async fn forget(&self, session_id: &str) {
        self.forgotten.lock().await.push(session_id.to_string());
    }
}

/// Verifier double mapping fixed bearer tokens to user ids.
#[derive(Default)]
pub struct StaticVerifier {
    tokens: Mutex<HashMap<String, String>>,
}

impl StaticVerifier {
    pub async fn allow(&self, token: &str, user_id: &str) {
        self.tokens
            .lock()
            .await
            .insert(token.to_string(), user_id.to_string());
    }
}

#[async_trait]
impl TokenVerifier for StaticVerifier {
    async fn verify(&self, bearer: &str) -> Result<String> {
        self.tokens
            .lock()
            .await
            .get(bearer.trim())
            .cloned()
            .ok_or(Error::Unauthorized)
    }
}

/// One bundle of in-memory services wired the way the server wires the
/// real ones.
pub struct TestHarness {
    pub db: Arc<MemoryDatabase>,
    pub storage: Arc<MemoryObjectStore>,
    pub voice: Arc<ScriptedVoice>,
    pub video: Arc<ScriptedVideo>,
    pub chat: Arc<ScriptedChat>,
    pub verifier: Arc<StaticVerifier>,
    pub avatars: Arc<AvatarCache>,
    pub usage: Arc<UsageAccountant>,
    job_store: JobStore,
}

impl TestHarness {
    pub async fn empty() -> Self {
        let db = Arc::new(MemoryDatabase::default());
        let storage = Arc::new(MemoryObjectStore::default());
        let voice = Arc::new(ScriptedVoice::default());
        let video = Arc::new(ScriptedVideo::default());
        let chat = Arc::new(ScriptedChat::default());
        let verifier = Arc::new(StaticVerifier::default());
        verifier.allow("valid-token", "user-1").await;

        let avatars = Arc::new(AvatarCache::new(db.clone()));
        let usage = Arc::new(UsageAccountant::new(db.clone()));
        let job_store = JobStore::new(db.clone());

        Self {
            db,
            storage,
            voice,
            video,
            chat,
            verifier,
            avatars,
            usage,
            job_store,
        }
    }

    pub async fn with_default_avatar() -> Self {
        let harness = Self::empty().await;
        harness.db.seed_avatar(default_avatar()).await;
        harness
    }

    pub async fn with_avatar_missing_voice() -> Self {
        let harness = Self::empty().await;
        let mut avatar = default_avatar();
        avatar.voice_sample_url = None;
        harness.db.seed_avatar(avatar).await;
        harness
    }

    pub fn store(&self) -> &JobStore {
        &self.job_store
    }

    pub fn deps(&self) -> PipelineDeps {
        PipelineDeps {
            store: self.job_store.clone(),
            avatars: self.avatars.clone(),
            voice: self.voice.clone(),
            video: self.video.clone(),
            storage: self.storage.clone(),
            usage: self.usage.clone(),
        }
    }

    pub async fn usage_used(&self, owner_id: &str, resource: UsageResource) -> f64 {
        self.db
            .fetch_usage(owner_id, resource)
            .await
            .unwrap()
            .map(|c| c.used)
            .unwrap_or(0.0)
    }
}

pub fn default_avatar() -> Avatar {
    Avatar {
        id: "avatar-1".to_string(),
        owner_id: "user-1".to_string(),
        name: "Maya".to_string(),
        image_url: Some("https://cdn.example/maya.png".to_string()),
        voice_sample_url: Some("https://cdn.example/maya.wav".to_string()),
        persona: Some("You are Maya, a cheerful guide.".to_string()),
        language: Some("en".to_string()),
        is_public: true,
    }
}
