//! Task repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nexus_core::ResourceId;
use nexus_core::task::{Task, TaskStatus, TaskType};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, sqlx::FromRow)]
struct TaskRow {
    task_id: uuid::Uuid,
    task_type: String,
    project_id: uuid::Uuid,
    status: String,
    priority: i32,
    payload: serde_json::Value,
    result: Option<serde_json::Value>,
    error_message: Option<String>,
    retry_count: i32,
    worker_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TaskRow {
    fn into_domain(self) -> DbResult<Task> {
        let task_type = TaskType::parse(&self.task_type)
            .ok_or_else(|| DbError::Corrupt(format!("task type {}", self.task_type)))?;
        let status = TaskStatus::parse(&self.status)
            .ok_or_else(|| DbError::Corrupt(format!("task status {}", self.status)))?;
        Ok(Task {
            task_id: ResourceId::from_uuid(self.task_id),
            task_type,
            project_id: ResourceId::from_uuid(self.project_id),
            status,
            priority: self.priority,
            payload: self.payload,
            result: self.result,
            error_message: self.error_message,
            retry_count: self.retry_count,
            worker_id: self.worker_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

#[async_trait]
pub trait TaskRepo: Send + Sync {
    async fn create(&self, task: &Task) -> DbResult<()>;
    async fn get(&self, id: ResourceId) -> DbResult<Task>;
    async fn set_status(&self, id: ResourceId, status: TaskStatus) -> DbResult<()>;
    /// Mark a task running and record the worker that leased it.
    async fn mark_running(&self, id: ResourceId, worker_id: &str) -> DbResult<()>;
    async fn finish(
        &self,
        id: ResourceId,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
    ) -> DbResult<()>;
    /// Bump the retry counter, returning the new count.
    async fn increment_retry(&self, id: ResourceId) -> DbResult<i32>;
}

/// PostgreSQL implementation of TaskRepo.
pub struct PgTaskRepo {
    pool: PgPool,
}

impl PgTaskRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskRepo for PgTaskRepo {
    async fn create(&self, task: &Task) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (task_id, task_type, project_id, status, priority,
                               payload, result, error_message, retry_count,
                               worker_id, created_at, updated_at, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW(), NOW(), $11, $12)
            "#,
        )
        .bind(task.task_id.as_uuid())
        .bind(task.task_type.as_str())
        .bind(task.project_id.as_uuid())
        .bind(task.status.as_str())
        .bind(task.priority)
        .bind(&task.payload)
        .bind(&task.result)
        .bind(&task.error_message)
        .bind(task.retry_count)
        .bind(&task.worker_id)
        .bind(task.started_at)
        .bind(task.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: ResourceId) -> DbResult<Task> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE task_id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("task {}", id)))?;
        row.into_domain()
    }

    async fn set_status(&self, id: ResourceId, status: TaskStatus) -> DbResult<()> {
        sqlx::query("UPDATE tasks SET status = $2, updated_at = NOW() WHERE task_id = $1")
            .bind(id.as_uuid())
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_running(&self, id: ResourceId, worker_id: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'running', worker_id = $2,
                started_at = COALESCE(started_at, NOW()), updated_at = NOW()
            WHERE task_id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish(
        &self,
        id: ResourceId,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
    ) -> DbResult<()> {
        let completed = status.is_terminal();
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = $2, result = COALESCE($3, result),
                error_message = $4, updated_at = NOW(),
                completed_at = CASE WHEN $5 THEN NOW() ELSE completed_at END
            WHERE task_id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(result)
        .bind(error_message)
        .bind(completed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn increment_retry(&self, id: ResourceId) -> DbResult<i32> {
        let row: (i32,) = sqlx::query_as(
            "UPDATE tasks SET retry_count = retry_count + 1, updated_at = NOW() WHERE task_id = $1 RETURNING retry_count",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("task {}", id)))?;
        Ok(row.0)
    }
}
