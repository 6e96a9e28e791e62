//! Project repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nexus_core::ResourceId;
use nexus_core::project::{
    AggregatedMetrics, ControlStatus, ErrorInfo, Project, ProjectStatus, WorkflowType,
};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::{DbError, DbResult};

/// A project row as stored in PostgreSQL.
#[derive(Debug, Clone, sqlx::FromRow)]
struct ProjectRow {
    project_id: uuid::Uuid,
    project_name: String,
    workflow_type: String,
    requirement: String,
    status: String,
    control_status: String,
    current_stage: Option<String>,
    progress: f64,
    priority: i32,
    tags: serde_json::Value,
    user_id: Option<String>,
    error_info: Option<serde_json::Value>,
    aggregated_metrics: serde_json::Value,
    pause_requested_at: Option<DateTime<Utc>>,
    stop_requested_at: Option<DateTime<Utc>>,
    resume_from_stage: Option<String>,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl ProjectRow {
    fn into_domain(self) -> DbResult<Project> {
        let status = ProjectStatus::parse(&self.status)
            .ok_or_else(|| DbError::Corrupt(format!("project status {}", self.status)))?;
        let control_status = ControlStatus::parse(&self.control_status)
            .ok_or_else(|| DbError::Corrupt(format!("control status {}", self.control_status)))?;
        let workflow_type = WorkflowType::parse(&self.workflow_type)
            .ok_or_else(|| DbError::Corrupt(format!("workflow type {}", self.workflow_type)))?;

        let aggregated_metrics: AggregatedMetrics =
            serde_json::from_value(self.aggregated_metrics).unwrap_or_default();
        let error_info: Option<ErrorInfo> = self
            .error_info
            .map(serde_json::from_value)
            .transpose()
            .unwrap_or_default();
        let tags: Vec<String> = serde_json::from_value(self.tags).unwrap_or_default();
        let metadata = serde_json::from_value(self.metadata).unwrap_or_default();

        Ok(Project {
            project_id: ResourceId::from_uuid(self.project_id),
            project_name: self.project_name,
            workflow_type,
            requirement: self.requirement,
            status,
            control_status,
            current_stage: self.current_stage,
            progress: self.progress,
            priority: self.priority,
            tags,
            user_id: self.user_id,
            error_info,
            aggregated_metrics,
            pause_requested_at: self.pause_requested_at,
            stop_requested_at: self.stop_requested_at,
            resume_from_stage: self.resume_from_stage,
            metadata,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

/// Partial update for a project record. `Some(None)` clears a
/// nullable column; absent fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ProjectUpdate {
    pub project_name: Option<String>,
    pub status: Option<ProjectStatus>,
    pub control_status: Option<ControlStatus>,
    pub current_stage: Option<Option<String>>,
    pub progress: Option<f64>,
    pub error_info: Option<Option<ErrorInfo>>,
    pub aggregated_metrics: Option<AggregatedMetrics>,
    pub pause_requested_at: Option<Option<DateTime<Utc>>>,
    pub stop_requested_at: Option<Option<DateTime<Utc>>>,
    pub resume_from_stage: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
}

impl ProjectUpdate {
    pub fn status(status: ProjectStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait ProjectRepo: Send + Sync {
    async fn create(&self, project: &Project) -> DbResult<()>;
    async fn get(&self, id: ResourceId) -> DbResult<Project>;
    async fn try_get(&self, id: ResourceId) -> DbResult<Option<Project>>;
    async fn update(&self, id: ResourceId, update: ProjectUpdate) -> DbResult<()>;
    async fn list_by_status(&self, status: ProjectStatus, limit: i64) -> DbResult<Vec<Project>>;
}

/// PostgreSQL implementation of ProjectRepo.
pub struct PgProjectRepo {
    pool: PgPool,
}

impl PgProjectRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProjectRepo for PgProjectRepo {
    async fn create(&self, project: &Project) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO projects (
                project_id, project_name, workflow_type, requirement,
                status, control_status, current_stage, progress, priority,
                tags, user_id, error_info, aggregated_metrics,
                pause_requested_at, stop_requested_at, resume_from_stage,
                metadata, created_at, updated_at, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, $16, $17, NOW(), NOW(), $18, $19)
            "#,
        )
        .bind(project.project_id.as_uuid())
        .bind(&project.project_name)
        .bind(project.workflow_type.as_str())
        .bind(&project.requirement)
        .bind(project.status.as_str())
        .bind(project.control_status.as_str())
        .bind(&project.current_stage)
        .bind(project.progress)
        .bind(project.priority)
        .bind(serde_json::to_value(&project.tags)?)
        .bind(&project.user_id)
        .bind(
            project
                .error_info
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(serde_json::to_value(&project.aggregated_metrics)?)
        .bind(project.pause_requested_at)
        .bind(project.stop_requested_at)
        .bind(&project.resume_from_stage)
        .bind(serde_json::to_value(&project.metadata)?)
        .bind(project.started_at)
        .bind(project.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: ResourceId) -> DbResult<Project> {
        self.try_get(id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("project {}", id)))
    }

    async fn try_get(&self, id: ResourceId) -> DbResult<Option<Project>> {
        let row = sqlx::query_as::<_, ProjectRow>("SELECT * FROM projects WHERE project_id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(ProjectRow::into_domain).transpose()
    }

    async fn update(&self, id: ResourceId, update: ProjectUpdate) -> DbResult<()> {
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE projects SET updated_at = NOW()");

        if let Some(name) = update.project_name {
            qb.push(", project_name = ").push_bind(name);
        }
        if let Some(status) = update.status {
            qb.push(", status = ").push_bind(status.as_str());
        }
        if let Some(control) = update.control_status {
            qb.push(", control_status = ").push_bind(control.as_str());
        }
        if let Some(stage) = update.current_stage {
            qb.push(", current_stage = ").push_bind(stage);
        }
        if let Some(progress) = update.progress {
            qb.push(", progress = ").push_bind(progress);
        }
        if let Some(error_info) = update.error_info {
            let value = error_info.as_ref().map(serde_json::to_value).transpose()?;
            qb.push(", error_info = ").push_bind(value);
        }
        if let Some(metrics) = update.aggregated_metrics {
            qb.push(", aggregated_metrics = ")
                .push_bind(serde_json::to_value(&metrics)?);
        }
        if let Some(at) = update.pause_requested_at {
            qb.push(", pause_requested_at = ").push_bind(at);
        }
        if let Some(at) = update.stop_requested_at {
            qb.push(", stop_requested_at = ").push_bind(at);
        }
        if let Some(stage) = update.resume_from_stage {
            qb.push(", resume_from_stage = ").push_bind(stage);
        }
        if let Some(tags) = update.tags {
            qb.push(", tags = ").push_bind(serde_json::to_value(&tags)?);
        }
        if let Some(at) = update.started_at {
            qb.push(", started_at = ").push_bind(at);
        }
        if let Some(at) = update.completed_at {
            qb.push(", completed_at = ").push_bind(at);
        }

        qb.push(" WHERE project_id = ").push_bind(*id.as_uuid());
        let result = qb.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("project {}", id)));
        }
        Ok(())
    }

    async fn list_by_status(&self, status: ProjectStatus, limit: i64) -> DbResult<Vec<Project>> {
        let rows = sqlx::query_as::<_, ProjectRow>(
            "SELECT * FROM projects WHERE status = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ProjectRow::into_domain).collect()
    }
}
