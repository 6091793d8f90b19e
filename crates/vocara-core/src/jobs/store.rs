//! Job rows with validated state transitions.

use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::job::{GenerationJob, JobStatus, JobUpdate, NewJob};
use crate::time_ms;

/// CRUD plus the state machine over generation-job rows. All mutation of
/// job rows flows through here; handlers and runners never patch rows
/// directly.
#[derive(Clone)]
pub struct JobStore {
    db: Arc<dyn Database>,
}

impl JobStore {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub async fn create(&self, new: NewJob) -> Result<GenerationJob> {
        let job = GenerationJob {
            id: Uuid::new_v4(),
            owner_id: new.owner_id,
            avatar_id: new.avatar_id,
            kind: new.kind,
            input: new.input,
            script_text: new.script_text,
            source_audio_url: new.source_audio_url,
            quality: new.quality,
            language: new.language,
            upstream_task_id: None,
            result_url: None,
            status: JobStatus::Queued,
            progress: 0,
            error_message: None,
            created_at_ms: time_ms(),
            completed_at_ms: None,
        };
        self.db.insert_job(job).await
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<GenerationJob>> {
        self.db.fetch_job(job_id).await
    }

    pub async fn list_by_owner(
        &self,
        owner_id: &str,
        kind: crate::job::JobKind,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<GenerationJob>> {
        self.db.list_jobs(owner_id, kind, limit, offset).await
    }

    /// Delete a row for its owner. Missing rows are a no-op success so the
    /// delete endpoint stays idempotent.
    pub async fn delete(&self, job_id: Uuid, owner_id: &str) -> Result<bool> {
        self.db.delete_job(job_id, owner_id).await
    }

    /// Apply a validated status transition. Exiting a terminal state fails
    /// loudly with a store error.
    pub async fn transition(
        &self,
        job_id: Uuid,
        next: JobStatus,
        mut update: JobUpdate,
    ) -> Result<GenerationJob> {
        let job = self.require(job_id).await?;
        if !job.status.can_transition_to(next) {
            return Err(Error::store(format!(
                "illegal transition {} -> {} for job {job_id}",
                job.status.as_db_value(),
                next.as_db_value()
            )));
        }

        update.status = Some(next);
        if next.is_terminal() && update.completed_at_ms.is_none() {
            update.completed_at_ms = Some(time_ms());
        }
        self.db.update_job(job_id, &update).await
    }

    /// Like [`Self::transition`], but a row that is already terminal is
    /// left untouched and reported as `false`. This is the guard that
    /// keeps the poll loop and the worker callback from both completing
    /// (and double-billing) the same job.
    pub async fn try_transition(
        &self,
        job_id: Uuid,
        next: JobStatus,
        update: JobUpdate,
    ) -> Result<bool> {
        let job = self.require(job_id).await?;
        if job.status.is_terminal() {
            return Ok(false);
        }
        self.transition(job_id, next, update).await?;
        Ok(true)
    }

    /// Record pipeline progress. Writes are clamped monotone non-decreasing
    /// and skipped entirely on terminal rows; a stale runner ticking after
    /// a callback completion must not move the row backwards.
    pub async fn set_progress(&self, job_id: Uuid, progress: u8) -> Result<()> {
        let job = self.require(job_id).await?;
        if job.status.is_terminal() || progress <= job.progress {
            return Ok(());
        }
        self.db
            .update_job(job_id, &JobUpdate::progress(progress.min(100)))
            .await?;
        Ok(())
    }

    /// Update non-status columns (upstream task id, temp audio URL, ...).
    pub async fn update_fields(&self, job_id: Uuid, update: JobUpdate) -> Result<GenerationJob> {
        debug_assert!(update.status.is_none(), "status changes go through transition()");
        self.db.update_job(job_id, &update).await
    }

    pub async fn complete(&self, job_id: Uuid, result_url: String) -> Result<GenerationJob> {
        self.transition(
            job_id,
            JobStatus::Completed,
            JobUpdate {
                progress: Some(100),
                result_url: Some(result_url),
                ..JobUpdate::default()
            },
        )
        .await
    }

    /// Terminal-failure path: status, human message, progress reset to 0.
    pub async fn fail(&self, job_id: Uuid, error: &Error) {
        let update = JobUpdate {
            progress: Some(0),
            error_message: Some(error.to_string()),
            ..JobUpdate::default()
        };
        match self.try_transition(job_id, JobStatus::Failed, update).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(%job_id, "job already terminal, skipping failure write: {error}")
            }
            Err(store_err) => {
                warn!(%job_id, "failed to record job failure `{error}`: {store_err}")
            }
        }
    }

    async fn require(&self, job_id: Uuid) -> Result<GenerationJob> {
        self.get(job_id)
            .await?
            .ok_or_else(|| Error::store(format!("job {job_id} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobInput, JobKind, JobQuality};
    use crate::testing::MemoryDatabase;

    fn new_job() -> NewJob {
        NewJob {
            owner_id: "user-1".to_string(),
            avatar_id: "avatar-1".to_string(),
            kind: JobKind::Video,
            input: JobInput::Script,
            script_text: Some("Hello, world.".to_string()),
            source_audio_url: None,
            quality: JobQuality::Fast,
            language: "en".to_string(),
        }
    }

    async fn store() -> (JobStore, Arc<MemoryDatabase>) {
        let db = Arc::new(MemoryDatabase::default());
        (JobStore::new(db.clone()), db)
    }

    #[tokio::test]
    async fn create_seeds_a_queued_row() {
        let (store, _) = store().await;
        let job = store.create(new_job()).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress, 0);
        assert!(job.result_url.is_none());
    }

    #[tokio::test]
    async fn terminal_rows_refuse_transitions() {
        let (store, _) = store().await;
        let job = store.create(new_job()).await.unwrap();

        store
            .transition(job.id, JobStatus::Processing, JobUpdate::default())
            .await
            .unwrap();
        store.complete(job.id, "https://cdn/x.mp4".into()).await.unwrap();

        let err = store
            .transition(job.id, JobStatus::Failed, JobUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StoreError(_)));

        // The lenient variant reports no-op instead.
        let applied = store
            .try_transition(job.id, JobStatus::Failed, JobUpdate::default())
            .await
            .unwrap();
        assert!(!applied);
    }

    #[tokio::test]
    async fn progress_is_monotone_until_terminal() {
        let (store, _) = store().await;
        let job = store.create(new_job()).await.unwrap();
        store
            .transition(job.id, JobStatus::Processing, JobUpdate::progress(20))
            .await
            .unwrap();

        store.set_progress(job.id, 50).await.unwrap();
        store.set_progress(job.id, 30).await.unwrap(); // ignored
        assert_eq!(store.get(job.id).await.unwrap().unwrap().progress, 50);

        store.fail(job.id, &Error::internal("boom")).await;
        let failed = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.progress, 0);
        assert!(failed.error_message.unwrap().contains("boom"));

        // Progress writes after the terminal transition are dropped.
        store.set_progress(job.id, 90).await.unwrap();
        assert_eq!(store.get(job.id).await.unwrap().unwrap().progress, 0);
    }

    #[tokio::test]
    async fn completion_stamps_result_and_timestamp() {
        let (store, _) = store().await;
        let job = store.create(new_job()).await.unwrap();
        store
            .transition(job.id, JobStatus::Processing, JobUpdate::default())
            .await
            .unwrap();

        let done = store.complete(job.id, "https://cdn/x.mp4".into()).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100);
        assert_eq!(done.result_url.as_deref(), Some("https://cdn/x.mp4"));
        assert!(done.completed_at_ms.is_some());
    }

    #[tokio::test]
    async fn delete_then_reread_is_not_found_and_redelete_is_noop() {
        let (store, _) = store().await;
        let job = store.create(new_job()).await.unwrap();

        assert!(store.delete(job.id, "user-1").await.unwrap());
        assert!(store.get(job.id).await.unwrap().is_none());
        assert!(!store.delete(job.id, "user-1").await.unwrap());
    }

    #[tokio::test]
    async fn delete_checks_the_owner() {
        let (store, _) = store().await;
        let job = store.create(new_job()).await.unwrap();
        assert!(!store.delete(job.id, "someone-else").await.unwrap());
        assert!(store.get(job.id).await.unwrap().is_some());
    }
}
