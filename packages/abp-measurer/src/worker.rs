//! Queue-draining job worker.
//!
//! ```text
//! JobWorker
//!     │
//!     ├─► claim (JobQueue)
//!     ├─► validate + run (CrawlScheduler::run_value)
//!     │       └─► children enqueued back onto the same queue
//!     └─► mark succeeded / failed
//! ```
//!
//! Each claimed job is an independent unit of work: a failed branch is
//! marked failed and the worker moves on.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{MeasureError, QueueError};
use crate::scheduler::{CrawlOutcome, CrawlScheduler};
use crate::traits::queue::JobQueue;
use crate::types::JobId;

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// Worker ID for this instance
    pub worker_id: String,
    /// How long to wait when no jobs are available
    pub poll_interval: Duration,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl JobWorkerConfig {
    /// Create a new config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// Result of executing one claimed job.
#[derive(Debug)]
pub struct JobRun {
    pub id: JobId,
    pub outcome: Result<CrawlOutcome, MeasureError>,
}

/// Totals from [`JobWorker::drain`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub recorded: usize,
    pub unreachable: usize,
    pub failed: usize,
}

impl DrainStats {
    pub fn total(&self) -> usize {
        self.recorded + self.unreachable + self.failed
    }

    fn add(&mut self, run: &JobRun) {
        match &run.outcome {
            Ok(CrawlOutcome::Recorded(_)) => self.recorded += 1,
            Ok(CrawlOutcome::Unreachable { .. }) => self.unreachable += 1,
            Err(_) => self.failed += 1,
        }
    }
}

pub struct JobWorker {
    queue: Arc<dyn JobQueue>,
    scheduler: Arc<CrawlScheduler>,
    config: JobWorkerConfig,
}

impl JobWorker {
    pub fn new(queue: Arc<dyn JobQueue>, scheduler: Arc<CrawlScheduler>) -> Self {
        let config = JobWorkerConfig {
            poll_interval: scheduler.config().poll_interval,
            ..JobWorkerConfig::default()
        };
        Self::with_config(queue, scheduler, config)
    }

    pub fn with_config(
        queue: Arc<dyn JobQueue>,
        scheduler: Arc<CrawlScheduler>,
        config: JobWorkerConfig,
    ) -> Self {
        Self {
            queue,
            scheduler,
            config,
        }
    }

    /// Claim and execute one job, if any is pending.
    pub async fn run_once(&self) -> Result<Option<JobRun>, QueueError> {
        let Some(job) = self.queue.claim(&self.config.worker_id).await? else {
            return Ok(None);
        };
        debug!(job_id = %job.id, attempt = job.attempt, "claimed job");

        let outcome = self.scheduler.run_value(job.payload).await;
        match &outcome {
            Ok(_) => self.queue.mark_succeeded(job.id).await?,
            Err(e) => {
                warn!(job_id = %job.id, kind = e.kind(), error = %e, "job failed");
                self.queue
                    .mark_failed(job.id, &e.to_string(), e.kind())
                    .await?;
            }
        }

        Ok(Some(JobRun {
            id: job.id,
            outcome,
        }))
    }

    /// Execute jobs until the queue is empty, including every job enqueued
    /// along the way.
    pub async fn drain(&self) -> Result<DrainStats, QueueError> {
        let mut stats = DrainStats::default();
        while let Some(run) = self.run_once().await? {
            stats.add(&run);
        }
        info!(
            recorded = stats.recorded,
            unreachable = stats.unreachable,
            failed = stats.failed,
            "queue drained"
        );
        Ok(stats)
    }

    /// Poll the queue until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker_id = %self.config.worker_id, "job worker started");
        while !shutdown.is_cancelled() {
            let idle = match self.run_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    error!(error = %e, "job queue error");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
        info!(worker_id = %self.config.worker_id, "job worker stopped");
    }
}
