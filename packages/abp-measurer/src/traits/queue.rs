//! Job queue seam for child-crawl dispatch.
//!
//! Recursion never calls the scheduler directly: a parent enqueues one
//! message per sampled child and returns. Whoever drains the queue runs the
//! child as an independent unit of work.

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::QueueError;
use crate::types::{CrawlJob, JobId};

/// A claimed job ready for execution.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: JobId,
    /// The raw job message, validated by the worker before execution
    pub payload: serde_json::Value,
    pub attempt: i32,
}

impl ClaimedJob {
    /// Deserialize the payload.
    pub fn deserialize<C: DeserializeOwned>(&self) -> Result<C, QueueError> {
        serde_json::from_value(self.payload.clone()).map_err(QueueError::Serialize)
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job for execution.
    async fn enqueue(&self, job: &CrawlJob) -> Result<JobId, QueueError>;

    /// Enqueue an untyped message (e.g. forwarded from an external trigger).
    async fn enqueue_raw(&self, payload: serde_json::Value) -> Result<JobId, QueueError>;

    /// Claim the next pending job, if any.
    async fn claim(&self, worker_id: &str) -> Result<Option<ClaimedJob>, QueueError>;

    async fn mark_succeeded(&self, id: JobId) -> Result<(), QueueError>;

    async fn mark_failed(&self, id: JobId, error: &str, kind: &str) -> Result<(), QueueError>;
}
