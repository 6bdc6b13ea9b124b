//! In-memory job queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::error::QueueError;
use crate::traits::queue::{ClaimedJob, JobQueue};
use crate::types::{CrawlJob, JobId};

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

/// One queued job and its execution state.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: i32,
    pub worker_id: Option<String>,
    pub error_message: Option<String>,
    pub error_kind: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<JobId>,
    jobs: HashMap<JobId, JobRecord>,
    order: Vec<JobId>,
}

/// FIFO job queue held in process memory.
#[derive(Default)]
pub struct MemoryJobQueue {
    state: Mutex<QueueState>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All jobs in enqueue order.
    pub fn jobs(&self) -> Vec<JobRecord> {
        let state = self.state();
        state
            .order
            .iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.state()
            .jobs
            .values()
            .filter(|job| job.status == status)
            .count()
    }

    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        self.state().jobs.get(&id).cloned()
    }

    fn update(&self, id: JobId, f: impl FnOnce(&mut JobRecord)) -> Result<(), QueueError> {
        let mut state = self.state();
        let job = state.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        f(job);
        Ok(())
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: &CrawlJob) -> Result<JobId, QueueError> {
        let payload = serde_json::to_value(job)?;
        self.enqueue_raw(payload).await
    }

    async fn enqueue_raw(&self, payload: serde_json::Value) -> Result<JobId, QueueError> {
        let id = Uuid::now_v7();
        let mut state = self.state();
        state.jobs.insert(
            id,
            JobRecord {
                id,
                payload,
                status: JobStatus::Pending,
                attempts: 0,
                worker_id: None,
                error_message: None,
                error_kind: None,
                created_at: Utc::now(),
            },
        );
        state.order.push(id);
        state.pending.push_back(id);
        Ok(id)
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<ClaimedJob>, QueueError> {
        let mut state = self.state();
        let Some(id) = state.pending.pop_front() else {
            return Ok(None);
        };
        let job = state.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        job.status = JobStatus::Running;
        job.attempts += 1;
        job.worker_id = Some(worker_id.to_string());
        Ok(Some(ClaimedJob {
            id,
            payload: job.payload.clone(),
            attempt: job.attempts,
        }))
    }

    async fn mark_succeeded(&self, id: JobId) -> Result<(), QueueError> {
        self.update(id, |job| job.status = JobStatus::Succeeded)
    }

    async fn mark_failed(&self, id: JobId, error: &str, kind: &str) -> Result<(), QueueError> {
        self.update(id, |job| {
            job.status = JobStatus::Failed;
            job.error_message = Some(error.to_string());
            job.error_kind = Some(kind.to_string());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(url: &str) -> CrawlJob {
        CrawlJob::new("b", vec!["https://lists.test/a.txt".into()]).with_url(url)
    }

    #[tokio::test]
    async fn claims_in_fifo_order() {
        let queue = MemoryJobQueue::new();
        let first = queue.enqueue(&job("http://site.test/1")).await.unwrap();
        let second = queue.enqueue(&job("http://site.test/2")).await.unwrap();

        let claimed = queue.claim("w1").await.unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.attempt, 1);
        let parsed: CrawlJob = claimed.deserialize().unwrap();
        assert_eq!(parsed.url.as_deref(), Some("http://site.test/1"));

        assert_eq!(queue.claim("w1").await.unwrap().unwrap().id, second);
        assert!(queue.claim("w1").await.unwrap().is_none());
        assert_eq!(queue.count(JobStatus::Running), 2);
    }

    #[tokio::test]
    async fn records_terminal_status() {
        let queue = MemoryJobQueue::new();
        let ok = queue.enqueue(&job("http://site.test/ok")).await.unwrap();
        let bad = queue.enqueue(&job("http://site.test/bad")).await.unwrap();
        queue.claim("w").await.unwrap();
        queue.claim("w").await.unwrap();

        queue.mark_succeeded(ok).await.unwrap();
        queue.mark_failed(bad, "browser crashed", "automation").await.unwrap();

        assert_eq!(queue.get(ok).unwrap().status, JobStatus::Succeeded);
        let failed = queue.get(bad).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_kind.as_deref(), Some("automation"));
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let queue = MemoryJobQueue::new();
        assert!(matches!(
            queue.mark_succeeded(Uuid::nil()).await,
            Err(QueueError::NotFound(_))
        ));
    }
}
