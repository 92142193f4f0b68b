//! In-process job runner
//!
//! `TokioJobQueue` implements `JobQueue` by spawning one task per job: sleep
//! for the requested delay, wait for a slot on the job's queue, run the
//! coordinator, then re-enqueue failures for as long as the retry policy
//! allows. Each queue has its own concurrency limit so a backlog of
//! maintenance refreshes cannot hold up user-facing ones. Jobs waiting on a
//! delay live only in memory; the periodic scan re-discovers tokens after a
//! restart.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use connection_health::{JobQueue, QueueName, RefreshCoordinator, RefreshJob};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Counters reported on `/health`
#[derive(Debug, Default)]
pub struct RunnerStats {
    /// Enqueued and still waiting out their delay or for a queue slot
    pub pending: AtomicU64,
    /// Currently inside `coordinate_refresh`
    pub in_flight: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub retried: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub pending: u64,
    pub in_flight: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
}

impl RunnerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            pending: self.pending.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }
}

/// Jobs allowed inside the coordinator at once, per queue
#[derive(Debug, Clone, Copy)]
pub struct QueueLimits {
    pub high: usize,
    pub maintenance: usize,
}

/// Job queue that runs refresh jobs on the tokio runtime.
#[derive(Clone)]
pub struct TokioJobQueue {
    coordinator: Arc<RefreshCoordinator>,
    high: Arc<Semaphore>,
    maintenance: Arc<Semaphore>,
    stats: Arc<RunnerStats>,
    closed: Arc<AtomicBool>,
}

impl TokioJobQueue {
    pub fn new(coordinator: Arc<RefreshCoordinator>, limits: QueueLimits) -> Self {
        Self {
            coordinator,
            high: Arc::new(Semaphore::new(limits.high)),
            maintenance: Arc::new(Semaphore::new(limits.maintenance)),
            stats: Arc::new(RunnerStats::default()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn slots(&self, queue: QueueName) -> Arc<Semaphore> {
        match queue {
            QueueName::High => self.high.clone(),
            QueueName::Maintenance => self.maintenance.clone(),
        }
    }

    pub fn stats(&self) -> Arc<RunnerStats> {
        self.stats.clone()
    }

    /// Stop accepting jobs. Delayed jobs that wake up after this are dropped.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until no job is inside the coordinator, or `timeout` elapses.
    /// Returns whether the runner drained.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.stats.in_flight.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    fn spawn_job(&self, job: RefreshJob, queue: QueueName, delay: Duration) {
        self.stats.pending.fetch_add(1, Ordering::Relaxed);
        let this = self.clone();
        tokio::spawn(async move { this.run(job, queue, delay).await });
    }

    async fn run(self, job: RefreshJob, queue: QueueName, delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let slots = self.slots(queue);
        if slots.available_permits() == 0 {
            debug!(job_id = %job.id, %queue, "queue at its concurrency limit, waiting");
        }
        let permit = slots.acquire_owned().await;
        self.stats.pending.fetch_sub(1, Ordering::Relaxed);
        if self.is_closed() {
            info!(job_id = %job.id, user_id = %job.user_id, "runner closed, dropping job");
            return;
        }
        // The semaphores are never closed
        let Ok(_permit) = permit else { return };

        self.stats.in_flight.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let result = self
            .coordinator
            .coordinate_refresh(&job.user_id, job.provider)
            .await;
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        crate::metrics::record_job(result.label(), started.elapsed().as_secs_f64());

        let Some(kind) = result.error_kind() else {
            self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
            info!(
                job_id = %job.id,
                user_id = %job.user_id,
                provider = %job.provider,
                %queue,
                outcome = result.label(),
                "refresh job finished"
            );
            return;
        };

        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        match self
            .coordinator
            .next_retry(&job.user_id, job.provider, kind)
            .await
        {
            Some(retry_in) if !self.is_closed() => {
                self.stats.retried.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_retry(kind.as_str());
                warn!(
                    job_id = %job.id,
                    user_id = %job.user_id,
                    provider = %job.provider,
                    error_kind = kind.as_str(),
                    retry_in_secs = retry_in.as_secs(),
                    "refresh job failed, retrying"
                );
                self.spawn_job(job, queue, retry_in);
            }
            _ => {
                warn!(
                    job_id = %job.id,
                    user_id = %job.user_id,
                    provider = %job.provider,
                    error_kind = kind.as_str(),
                    message = result.message(),
                    "refresh job failed, not retrying"
                );
            }
        }
    }
}

impl JobQueue for TokioJobQueue {
    fn enqueue<'a>(
        &'a self,
        job: RefreshJob,
        queue: QueueName,
        delay: Duration,
    ) -> Pin<Box<dyn Future<Output = connection_health::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(connection_health::Error::Queue(
                    "runner is shutting down".into(),
                ));
            }
            self.spawn_job(job, queue, delay);
            Ok(())
        })
    }
}
