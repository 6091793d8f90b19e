//! FIFO job queue with a bounded worker pool.
//!
//! The pool width `W` is the only global backpressure knob: at most `W`
//! jobs run concurrently and the process never overcommits the upstream
//! GPU services. The queue lives in memory only; rows still `queued` at
//! restart are simply re-submitted or reclaimed by the reaper.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::job::{GenerationJob, JobStatus, JobUpdate};
use crate::jobs::store::JobStore;

/// One job pipeline. Implementations return `Err` to fail the row; the
/// worker loop is the single place that turns an error (or a panic) into
/// the terminal `failed` transition.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(&self, job: GenerationJob, cancel: CancellationToken) -> Result<()>;
}

pub struct JobScheduler {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    store: JobStore,
    runner: Arc<dyn JobRunner>,
    queue: Mutex<VecDeque<Uuid>>,
    capacity: usize,
    wakeup: Notify,
    draining: AtomicBool,
    shutdown: CancellationToken,
}

impl JobScheduler {
    /// Spawn `workers` consumer tasks over a queue bounded at `capacity`.
    pub fn start(
        store: JobStore,
        runner: Arc<dyn JobRunner>,
        workers: usize,
        capacity: usize,
    ) -> Self {
        let inner = Arc::new(Inner {
            store,
            runner,
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            wakeup: Notify::new(),
            draining: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let inner = inner.clone();
                tokio::spawn(async move { worker_loop(inner, worker_id).await })
            })
            .collect();

        Self {
            inner,
            workers: Mutex::new(handles),
        }
    }

    /// Enqueue a job whose row is already persisted in `queued`.
    /// Non-blocking; fails once the soft bound is exceeded or while the
    /// scheduler is draining.
    pub fn submit(&self, job_id: Uuid) -> Result<()> {
        if self.inner.draining.load(Ordering::SeqCst) {
            return Err(Error::store("scheduler is draining, submit refused"));
        }

        {
            let mut queue = self.inner.queue.lock().expect("queue lock poisoned");
            if queue.len() >= self.inner.capacity {
                return Err(Error::QueueFull);
            }
            queue.push_back(job_id);
        }
        self.inner.wakeup.notify_one();
        Ok(())
    }

    /// Stop accepting work and wait for in-flight runners to finish.
    /// Jobs still queued are left unstarted (their rows stay `queued`).
    pub async fn drain(&self) {
        self.inner.draining.store(true, Ordering::SeqCst);
        self.inner.wakeup.notify_waiters();
        self.join_workers().await;
    }

    /// Drain and additionally cancel in-flight runners, which must mark
    /// their rows failed before exiting.
    pub async fn shutdown(&self) {
        self.inner.draining.store(true, Ordering::SeqCst);
        self.inner.shutdown.cancel();
        self.inner.wakeup.notify_waiters();
        self.join_workers().await;
    }

    pub fn queued_len(&self) -> usize {
        self.inner.queue.lock().expect("queue lock poisoned").len()
    }

    async fn join_workers(&self) {
        let handles = std::mem::take(&mut *self.workers.lock().expect("worker lock poisoned"));
        for handle in handles {
            if let Err(err) = handle.await {
                error!("scheduler worker exited abnormally: {err}");
            }
        }
    }
}

async fn worker_loop(inner: Arc<Inner>, worker_id: usize) {
    loop {
        if inner.draining.load(Ordering::SeqCst) {
            debug!(worker_id, "scheduler worker stopping");
            break;
        }

        let next = inner.queue.lock().expect("queue lock poisoned").pop_front();
        match next {
            Some(job_id) => execute(&inner, job_id).await,
            None => {
                tokio::select! {
                    _ = inner.wakeup.notified() => {}
                    _ = inner.shutdown.cancelled() => {}
                }
            }
        }
    }
}

/// Run one job to completion. A runner error or panic marks the row
/// failed; nothing propagates to the other workers.
async fn execute(inner: &Arc<Inner>, job_id: Uuid) {
    let job = match inner.store.get(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            warn!(%job_id, "queued job vanished before dispatch");
            return;
        }
        Err(err) => {
            warn!(%job_id, "failed to load queued job: {err}");
            return;
        }
    };

    if let Err(err) = inner
        .store
        .transition(job_id, JobStatus::Processing, JobUpdate::progress(20))
        .await
    {
        warn!(%job_id, "job not dispatchable: {err}");
        return;
    }

    let cancel = inner.shutdown.child_token();
    let runner = inner.runner.clone();
    let handle = tokio::spawn(async move { runner.run(job, cancel).await });

    match handle.await {
        Ok(Ok(())) => debug!(%job_id, "job finished"),
        Ok(Err(err)) => inner.store.fail(job_id, &err).await,
        Err(join_err) => {
            let err = if join_err.is_panic() {
                Error::internal("job runner panicked")
            } else {
                Error::ShutdownAborted
            };
            inner.store.fail(job_id, &err).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobInput, JobKind, JobQuality, NewJob};
    use crate::testing::MemoryDatabase;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    fn new_job(n: usize) -> NewJob {
        NewJob {
            owner_id: "user-1".to_string(),
            avatar_id: format!("avatar-{n}"),
            kind: JobKind::Audio,
            input: JobInput::Script,
            script_text: Some("Hello.".to_string()),
            source_audio_url: None,
            quality: JobQuality::Fast,
            language: "en".to_string(),
        }
    }

    /// Records dispatch order and the high-water mark of concurrency.
    struct ProbeRunner {
        order: AsyncMutex<Vec<Uuid>>,
        running: AtomicUsize,
        peak: AtomicUsize,
        complete_jobs: bool,
        store: JobStore,
    }

    #[async_trait]
    impl JobRunner for ProbeRunner {
        async fn run(&self, job: GenerationJob, _cancel: CancellationToken) -> Result<()> {
            self.order.lock().await.push(job.id);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.complete_jobs {
                self.store
                    .complete(job.id, "https://cdn/out.wav".into())
                    .await?;
            }
            Ok(())
        }
    }

    async fn wait_for_status(store: &JobStore, id: Uuid, status: JobStatus) {
        for _ in 0..200 {
            if store.get(id).await.unwrap().unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {id} never reached {status:?}");
    }

    #[tokio::test]
    async fn single_worker_dispatches_in_submit_order() {
        let db = Arc::new(MemoryDatabase::default());
        let store = JobStore::new(db);
        let runner = Arc::new(ProbeRunner {
            order: AsyncMutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            complete_jobs: true,
            store: store.clone(),
        });

        let scheduler = JobScheduler::start(store.clone(), runner.clone(), 1, 16);

        let mut ids = Vec::new();
        for n in 0..4 {
            let job = store.create(new_job(n)).await.unwrap();
            scheduler.submit(job.id).unwrap();
            ids.push(job.id);
        }

        for id in &ids {
            wait_for_status(&store, *id, JobStatus::Completed).await;
        }

        let order = runner.order.lock().await.clone();
        assert_eq!(order, ids);
        assert_eq!(runner.peak.load(Ordering::SeqCst), 1);

        scheduler.drain().await;
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_the_pool_width() {
        let db = Arc::new(MemoryDatabase::default());
        let store = JobStore::new(db);
        let runner = Arc::new(ProbeRunner {
            order: AsyncMutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            complete_jobs: true,
            store: store.clone(),
        });

        let scheduler = JobScheduler::start(store.clone(), runner.clone(), 2, 16);

        let mut ids = Vec::new();
        for n in 0..6 {
            let job = store.create(new_job(n)).await.unwrap();
            scheduler.submit(job.id).unwrap();
            ids.push(job.id);
        }

        for id in &ids {
            wait_for_status(&store, *id, JobStatus::Completed).await;
        }

        let peak = runner.peak.load(Ordering::SeqCst);
        assert!(peak <= 2, "worker bound violated: peak {peak}");

        scheduler.drain().await;
    }

    #[tokio::test]
    async fn a_panicking_runner_fails_its_job_and_frees_the_worker() {
        struct PanickyRunner {
            store: JobStore,
        }

        #[async_trait]
        impl JobRunner for PanickyRunner {
            async fn run(&self, job: GenerationJob, _cancel: CancellationToken) -> Result<()> {
                if job.avatar_id == "avatar-0" {
                    panic!("synthetic runner panic");
                }
                self.store.complete(job.id, "https://cdn/ok.wav".into()).await?;
                Ok(())
            }
        }

        let db = Arc::new(MemoryDatabase::default());
        let store = JobStore::new(db);
        let runner = Arc::new(PanickyRunner { store: store.clone() });
        let scheduler = JobScheduler::start(store.clone(), runner, 1, 16);

        let bad = store.create(new_job(0)).await.unwrap();
        let good = store.create(new_job(1)).await.unwrap();
        scheduler.submit(bad.id).unwrap();
        scheduler.submit(good.id).unwrap();

        wait_for_status(&store, bad.id, JobStatus::Failed).await;
        wait_for_status(&store, good.id, JobStatus::Completed).await;

        let failed = store.get(bad.id).await.unwrap().unwrap();
        assert!(failed.error_message.unwrap().contains("panicked"));

        scheduler.drain().await;
    }

    #[tokio::test]
    async fn queue_overflow_rejects_submits() {
        // A runner that parks forever keeps the single worker busy.
        struct ParkedRunner;

        #[async_trait]
        impl JobRunner for ParkedRunner {
            async fn run(&self, _job: GenerationJob, cancel: CancellationToken) -> Result<()> {
                cancel.cancelled().await;
                Err(Error::ShutdownAborted)
            }
        }

        let db = Arc::new(MemoryDatabase::default());
        let store = JobStore::new(db);
        let scheduler = JobScheduler::start(store.clone(), Arc::new(ParkedRunner), 1, 2);

        let mut ids = Vec::new();
        for n in 0..4 {
            ids.push(store.create(new_job(n)).await.unwrap().id);
        }

        // First submit is picked up by the worker; the next two fill the queue.
        scheduler.submit(ids[0]).unwrap();
        wait_for_status(&store, ids[0], JobStatus::Processing).await;
        scheduler.submit(ids[1]).unwrap();
        scheduler.submit(ids[2]).unwrap();

        let err = scheduler.submit(ids[3]).unwrap_err();
        assert!(matches!(err, Error::QueueFull));

        scheduler.shutdown().await;
        wait_for_status(&store, ids[0], JobStatus::Failed).await;
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_and_marks_rows_failed() {
        struct CancelAwareRunner;

        #[async_trait]
        impl JobRunner for CancelAwareRunner {
            async fn run(&self, _job: GenerationJob, cancel: CancellationToken) -> Result<()> {
                tokio::select! {
                    _ = cancel.cancelled() => Err(Error::ShutdownAborted),
                    _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(()),
                }
            }
        }

        let db = Arc::new(MemoryDatabase::default());
        let store = JobStore::new(db);
        let scheduler = JobScheduler::start(store.clone(), Arc::new(CancelAwareRunner), 1, 8);

        let job = store.create(new_job(0)).await.unwrap();
        scheduler.submit(job.id).unwrap();
        wait_for_status(&store, job.id, JobStatus::Processing).await;

        scheduler.shutdown().await;

        let row = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert!(row.error_message.unwrap().contains("shutdown"));

        let fresh = store.create(new_job(1)).await.unwrap();
        assert!(scheduler.submit(fresh.id).is_err(), "submit after drain must fail");
    }
}
