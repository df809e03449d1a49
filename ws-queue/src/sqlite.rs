//! Durable queue stored in SQLite.
//!
//! Messages carry a visibility deadline. Receiving claims the oldest visible
//! message in one statement, gives it a fresh receipt and hides it for the
//! visibility timeout; if the consumer never deletes it, it becomes visible
//! again and is redelivered.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{Job, JobQueue, ReceivedJob, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteQueueConfig {
    /// Long-poll budget of one `receive` call.
    pub wait_time_secs: u64,
    pub visibility_timeout_secs: u64,
    /// Re-check interval while long-polling.
    pub poll_interval_ms: u64,
}

impl Default for SqliteQueueConfig {
    fn default() -> Self {
        Self {
            wait_time_secs: 20,
            visibility_timeout_secs: 900,
            poll_interval_ms: 250,
        }
    }
}

#[derive(Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
    wait_time: Duration,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl SqliteQueue {
    /// Wrap `pool`, creating the queue table if needed.
    pub async fn new(pool: SqlitePool, config: SqliteQueueConfig) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                body TEXT NOT NULL,
                receipt_handle TEXT,
                visible_at INTEGER NOT NULL,
                receive_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_job_queue_visible ON job_queue (visible_at, id)",
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            wait_time: Duration::from_secs(config.wait_time_secs),
            visibility_timeout: Duration::from_secs(config.visibility_timeout_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        })
    }

    /// Override the timings, mostly for tests.
    pub fn with_timings(mut self, wait_time: Duration, visibility_timeout: Duration) -> Self {
        self.wait_time = wait_time;
        self.visibility_timeout = visibility_timeout;
        self
    }

    /// Messages currently stored, visible or not.
    pub async fn depth(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM job_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn try_claim(&self) -> Result<Option<ReceivedJob>> {
        let receipt = Uuid::new_v4().to_string();
        let now = now_millis();
        let hidden_until = now + self.visibility_timeout.as_millis() as i64;

        let claimed: Option<(String, i64)> = sqlx::query_as(
            r#"
            UPDATE job_queue
            SET receipt_handle = ?, visible_at = ?, receive_count = receive_count + 1
            WHERE id = (
                SELECT id FROM job_queue WHERE visible_at <= ? ORDER BY id LIMIT 1
            )
            RETURNING body, receive_count
            "#,
        )
        .bind(&receipt)
        .bind(hidden_until)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some((body, receive_count)) = claimed else {
            return Ok(None);
        };

        let job: Job = match serde_json::from_str(&body) {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, body = %body, "dropping malformed job payload");
                sqlx::query("DELETE FROM job_queue WHERE receipt_handle = ?")
                    .bind(&receipt)
                    .execute(&self.pool)
                    .await?;
                return Ok(None);
            }
        };
        if receive_count > 1 {
            debug!(
                workspace_id = %job.workspace_id,
                job = %job.kind,
                receive_count,
                "redelivering job"
            );
        }
        Ok(Some(ReceivedJob { job, receipt }))
    }
}

#[async_trait]
impl JobQueue for SqliteQueue {
    #[instrument(skip(self, job), fields(workspace_id = %job.workspace_id, job = %job.kind))]
    async fn send(&self, job: &Job) -> Result<()> {
        let body = serde_json::to_string(job)?;
        let now = now_millis();
        sqlx::query("INSERT INTO job_queue (body, visible_at, created_at) VALUES (?, ?, ?)")
            .bind(body)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Option<ReceivedJob>> {
        let deadline = tokio::time::Instant::now() + self.wait_time;
        loop {
            if let Some(received) = self.try_claim().await? {
                return Ok(Some(received));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    #[instrument(skip(self))]
    async fn delete(&self, receipt: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM job_queue WHERE receipt_handle = ?")
            .bind(receipt)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            warn!("receipt no longer owns a message; it was redelivered or already deleted");
        }
        Ok(())
    }
}
