//! PostgreSQL-backed job queue.
//!
//! Workers on different hosts claim from the same `crawl_jobs` table;
//! `FOR UPDATE SKIP LOCKED` hands each pending job to exactly one of them.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::error::QueueError;
use crate::queues::JobStatus;
use crate::traits::queue::{ClaimedJob, JobQueue};
use crate::types::{CrawlJob, JobId};

fn backend(err: sqlx::Error) -> QueueError {
    QueueError::Backend(Box::new(err))
}

pub struct PostgresJobQueue {
    pool: PgPool,
}

impl PostgresJobQueue {
    /// Create the queue on an existing pool, creating its table if needed.
    pub async fn new(pool: PgPool) -> Result<Self, QueueError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS crawl_jobs (
                id UUID PRIMARY KEY,
                args JSONB NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempt INTEGER NOT NULL DEFAULT 0,
                worker_id TEXT,
                error_message TEXT,
                error_kind TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(backend)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_crawl_jobs_pending ON crawl_jobs(created_at) WHERE status = 'pending'",
        )
        .execute(&pool)
        .await
        .map_err(backend)?;

        info!("crawl job queue ready");
        Ok(Self { pool })
    }

    /// Number of jobs in a given status.
    pub async fn count(&self, status: JobStatus) -> Result<i64, QueueError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM crawl_jobs WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.get("n"))
    }

    async fn set_status(
        &self,
        id: JobId,
        status: JobStatus,
        error: Option<&str>,
        kind: Option<&str>,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE crawl_jobs
            SET status = $1,
                error_message = $2,
                error_kind = $3,
                updated_at = NOW()
            WHERE id = $4
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(kind)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn enqueue(&self, job: &CrawlJob) -> Result<JobId, QueueError> {
        let payload = serde_json::to_value(job)?;
        self.enqueue_raw(payload).await
    }

    async fn enqueue_raw(&self, payload: serde_json::Value) -> Result<JobId, QueueError> {
        let id = Uuid::now_v7();
        sqlx::query("INSERT INTO crawl_jobs (id, args) VALUES ($1, $2)")
            .bind(id)
            .bind(&payload)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(id)
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<ClaimedJob>, QueueError> {
        let row = sqlx::query(
            r#"
            UPDATE crawl_jobs
            SET status = 'running',
                worker_id = $1,
                attempt = attempt + 1,
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM crawl_jobs
                WHERE status = 'pending'
                ORDER BY created_at, id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, args, attempt
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        Ok(row.map(|r| ClaimedJob {
            id: r.get("id"),
            payload: r.get("args"),
            attempt: r.get("attempt"),
        }))
    }

    async fn mark_succeeded(&self, id: JobId) -> Result<(), QueueError> {
        self.set_status(id, JobStatus::Succeeded, None, None).await
    }

    async fn mark_failed(&self, id: JobId, error: &str, kind: &str) -> Result<(), QueueError> {
        self.set_status(id, JobStatus::Failed, Some(error), Some(kind)).await
    }
}
