//! Reclaims `processing` rows orphaned by a crash or a worker that never
//! called back.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::db::Database;
use crate::error::Result;
use crate::job::{GenerationJob, JobKind, JobQuality, JobStatus, JobUpdate};
use crate::jobs::store::JobStore;
use crate::time_ms;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Start the periodic sweep; stops when `shutdown` is cancelled.
pub fn spawn_reaper(
    store: JobStore,
    db: Arc<dyn Database>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                _ = shutdown.cancelled() => break,
            }
            match sweep(&store, db.as_ref()).await {
                Ok(0) => {}
                Ok(reclaimed) => info!(reclaimed, "reaper reclaimed stuck jobs"),
                Err(err) => warn!("reaper sweep failed: {err}"),
            }
        }
    })
}

/// One sweep over the `processing` rows; returns how many were reclaimed.
pub async fn sweep(store: &JobStore, db: &dyn Database) -> Result<usize> {
    let now = time_ms();
    let mut reclaimed = 0usize;

    for job in db.list_jobs_by_status(JobStatus::Processing).await? {
        if !is_expired(&job, now) {
            continue;
        }
        let update = JobUpdate {
            error_message: Some("processing exceeded its render window".to_string()),
            ..JobUpdate::default()
        };
        match store.try_transition(job.id, JobStatus::TimedOut, update).await {
            Ok(true) => reclaimed += 1,
            Ok(false) => {}
            Err(err) => warn!(job_id = %job.id, "failed to reclaim job: {err}"),
        }
    }

    Ok(reclaimed)
}

fn is_expired(job: &GenerationJob, now_ms: u64) -> bool {
    let window = match job.kind {
        // Audio synthesis has no long render phase; the fast window is
        // generous already.
        JobKind::Audio => JobQuality::Fast.processing_timeout(),
        JobKind::Video => job.quality.processing_timeout(),
    };
    now_ms.saturating_sub(job.created_at_ms) > window.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobInput, NewJob};
    use crate::testing::MemoryDatabase;

    fn new_job(kind: JobKind, quality: JobQuality) -> NewJob {
        NewJob {
            owner_id: "user-1".to_string(),
            avatar_id: "avatar-1".to_string(),
            kind,
            input: JobInput::Script,
            script_text: Some("Hello.".to_string()),
            source_audio_url: None,
            quality,
            language: "en".to_string(),
        }
    }

    #[tokio::test]
    async fn sweeps_only_expired_processing_rows() {
        let db = Arc::new(MemoryDatabase::default());
        let store = JobStore::new(db.clone());

        let stale = store.create(new_job(JobKind::Video, JobQuality::Fast)).await.unwrap();
        let fresh = store.create(new_job(JobKind::Video, JobQuality::Fast)).await.unwrap();
        let queued = store.create(new_job(JobKind::Video, JobQuality::Fast)).await.unwrap();
        for id in [stale.id, fresh.id] {
            store
                .transition(id, JobStatus::Processing, JobUpdate::progress(20))
                .await
                .unwrap();
        }

        // Age the stale row past the 6-minute fast window.
        db.set_job_created_at(stale.id, time_ms() - 7 * 60 * 1_000).await;

        let reclaimed = sweep(&store, db.as_ref()).await.unwrap();
        assert_eq!(reclaimed, 1);

        assert_eq!(
            store.get(stale.id).await.unwrap().unwrap().status,
            JobStatus::TimedOut
        );
        assert_eq!(
            store.get(fresh.id).await.unwrap().unwrap().status,
            JobStatus::Processing
        );
        assert_eq!(
            store.get(queued.id).await.unwrap().unwrap().status,
            JobStatus::Queued
        );
    }

    #[tokio::test]
    async fn high_quality_rows_get_the_longer_window() {
        let db = Arc::new(MemoryDatabase::default());
        let store = JobStore::new(db.clone());

        let job = store.create(new_job(JobKind::Video, JobQuality::High)).await.unwrap();
        store
            .transition(job.id, JobStatus::Processing, JobUpdate::progress(20))
            .await
            .unwrap();

        // Ten minutes old: expired for fast, alive for high.
        db.set_job_created_at(job.id, time_ms() - 10 * 60 * 1_000).await;
        assert_eq!(sweep(&store, db.as_ref()).await.unwrap(), 0);

        db.set_job_created_at(job.id, time_ms() - 21 * 60 * 1_000).await;
        assert_eq!(sweep(&store, db.as_ref()).await.unwrap(), 1);
    }
}
