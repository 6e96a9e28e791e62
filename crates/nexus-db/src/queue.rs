//! Work queue backed by PostgreSQL.
//!
//! Messages carry per-consumer visibility leases: a claimed message
//! stays invisible until its lease expires or its holder deletes it,
//! and long-running handlers extend the lease through heartbeats.
//! Claims use SKIP LOCKED so workers never contend on the same row.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;

use crate::{DbError, DbResult};

/// How often `receive` re-polls while long-polling.
const POLL_STEP: Duration = Duration::from_secs(1);

/// A message leased from the queue.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueueMessage {
    pub id: uuid::Uuid,
    pub queue_name: String,
    pub body: serde_json::Value,
    pub attributes: serde_json::Value,
    pub priority: i32,
    pub leased_by: Option<String>,
    pub lease_expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub receive_count: i32,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Narrow interface over the work queue, so consumers never touch
/// the backing store directly.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue a message.
    async fn send(
        &self,
        queue_name: &str,
        body: serde_json::Value,
        attributes: HashMap<String, String>,
        priority: i32,
    ) -> DbResult<uuid::Uuid>;

    /// Long-poll for one message, leasing it for `visibility`.
    async fn receive(
        &self,
        queue_name: &str,
        worker_id: &str,
        wait: Duration,
        visibility: Duration,
    ) -> DbResult<Option<QueueMessage>>;

    /// Extend the lease on a message this worker holds (heartbeat).
    /// Fails with NotFound when the lease was lost.
    async fn extend_lease(
        &self,
        message_id: uuid::Uuid,
        worker_id: &str,
        visibility: Duration,
    ) -> DbResult<()>;

    /// Acknowledge (delete) a processed message.
    async fn delete(&self, message_id: uuid::Uuid, worker_id: &str) -> DbResult<()>;

    /// Return a claimed message to the pool immediately.
    async fn release(&self, message_id: uuid::Uuid) -> DbResult<()>;
}

/// Durable FIFO-ish queue with visibility leases, on PostgreSQL.
pub struct TaskQueue {
    pool: PgPool,
}

impl TaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn claim(
        &self,
        queue_name: &str,
        worker_id: &str,
        visibility: Duration,
    ) -> DbResult<Option<QueueMessage>> {
        let lease_expires = Utc::now() + chrono::Duration::from_std(visibility).unwrap_or_default();
        let message = sqlx::query_as::<_, QueueMessage>(
            r#"
            UPDATE task_queue
            SET leased_by = $2, lease_expires_at = $3, receive_count = receive_count + 1
            WHERE id = (
                SELECT id FROM task_queue
                WHERE queue_name = $1
                  AND (lease_expires_at IS NULL OR lease_expires_at < NOW())
                ORDER BY priority DESC, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(queue_name)
        .bind(worker_id)
        .bind(lease_expires)
        .fetch_optional(&self.pool)
        .await?;
        Ok(message)
    }
}

#[async_trait]
impl WorkQueue for TaskQueue {
    async fn send(
        &self,
        queue_name: &str,
        body: serde_json::Value,
        attributes: HashMap<String, String>,
        priority: i32,
    ) -> DbResult<uuid::Uuid> {
        let id = uuid::Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO task_queue (id, queue_name, body, attributes, priority, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            "#,
        )
        .bind(id)
        .bind(queue_name)
        .bind(body)
        .bind(serde_json::to_value(&attributes)?)
        .bind(priority)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn receive(
        &self,
        queue_name: &str,
        worker_id: &str,
        wait: Duration,
        visibility: Duration,
    ) -> DbResult<Option<QueueMessage>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(message) = self.claim(queue_name, worker_id, visibility).await? {
                return Ok(Some(message));
            }
            if tokio::time::Instant::now() + POLL_STEP > deadline {
                return Ok(None);
            }
            sleep(POLL_STEP).await;
        }
    }

    async fn extend_lease(
        &self,
        message_id: uuid::Uuid,
        worker_id: &str,
        visibility: Duration,
    ) -> DbResult<()> {
        let lease_expires = Utc::now() + chrono::Duration::from_std(visibility).unwrap_or_default();
        let result = sqlx::query(
            "UPDATE task_queue SET lease_expires_at = $3 WHERE id = $1 AND leased_by = $2",
        )
        .bind(message_id)
        .bind(worker_id)
        .bind(lease_expires)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("lease {}", message_id)));
        }
        Ok(())
    }

    async fn delete(&self, message_id: uuid::Uuid, worker_id: &str) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM task_queue WHERE id = $1 AND leased_by = $2")
            .bind(message_id)
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("message {}", message_id)));
        }
        Ok(())
    }

    async fn release(&self, message_id: uuid::Uuid) -> DbResult<()> {
        sqlx::query(
            "UPDATE task_queue SET leased_by = NULL, lease_expires_at = NULL WHERE id = $1",
        )
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
