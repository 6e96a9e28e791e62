//! Stage repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nexus_core::ResourceId;
use nexus_core::stage::{DesignDocument, FileMetadata, StageMetrics, StageRecord, StageStatus};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::{DbError, DbResult};

#[derive(Debug, Clone, sqlx::FromRow)]
struct StageRow {
    project_id: uuid::Uuid,
    stage_name: String,
    stage_number: i32,
    display_name: String,
    agent_name: Option<String>,
    status: String,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    duration_seconds: Option<f64>,
    metrics: Option<serde_json::Value>,
    agent_output_content: Option<String>,
    agent_output_blob_ref: Option<String>,
    design_document: Option<serde_json::Value>,
    generated_files: serde_json::Value,
    error_message: Option<String>,
    doc_path: Option<String>,
    created_at: DateTime<Utc>,
}

impl StageRow {
    fn into_domain(self) -> DbResult<StageRecord> {
        let status = StageStatus::parse(&self.status)
            .ok_or_else(|| DbError::Corrupt(format!("stage status {}", self.status)))?;
        let metrics: Option<StageMetrics> = self
            .metrics
            .map(serde_json::from_value)
            .transpose()
            .unwrap_or_default();
        let design_document: Option<DesignDocument> = self
            .design_document
            .map(serde_json::from_value)
            .transpose()
            .unwrap_or_default();
        let generated_files: Vec<FileMetadata> =
            serde_json::from_value(self.generated_files).unwrap_or_default();

        Ok(StageRecord {
            project_id: ResourceId::from_uuid(self.project_id),
            stage_name: self.stage_name,
            stage_number: self.stage_number,
            display_name: self.display_name,
            agent_name: self.agent_name,
            status,
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_seconds: self.duration_seconds,
            metrics,
            agent_output_content: self.agent_output_content,
            agent_output_blob_ref: self.agent_output_blob_ref,
            design_document,
            generated_files,
            error_message: self.error_message,
            doc_path: self.doc_path,
            created_at: self.created_at,
        })
    }
}

/// Seed data for pre-creating a pending stage at project creation.
#[derive(Debug, Clone)]
pub struct StageSeed {
    pub stage_name: String,
    pub stage_number: i32,
    pub display_name: String,
    pub agent_name: Option<String>,
}

/// Partial update for a stage record. `Some(None)` clears a nullable
/// column; absent fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct StageUpdate {
    pub status: Option<StageStatus>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub duration_seconds: Option<Option<f64>>,
    pub metrics: Option<Option<StageMetrics>>,
    pub agent_output_content: Option<Option<String>>,
    pub agent_output_blob_ref: Option<Option<String>>,
    pub design_document: Option<Option<DesignDocument>>,
    pub generated_files: Option<Vec<FileMetadata>>,
    pub error_message: Option<Option<String>>,
    pub doc_path: Option<Option<String>>,
}

impl StageUpdate {
    /// The reset applied when restarting from a stage: back to
    /// pending with all execution fields nulled.
    pub fn cleared() -> Self {
        Self {
            status: Some(StageStatus::Pending),
            started_at: Some(None),
            completed_at: Some(None),
            duration_seconds: Some(None),
            metrics: Some(None),
            agent_output_content: Some(None),
            agent_output_blob_ref: Some(None),
            design_document: Some(None),
            generated_files: Some(Vec::new()),
            error_message: Some(None),
            doc_path: Some(None),
        }
    }
}

#[async_trait]
pub trait StageRepo: Send + Sync {
    /// Pre-seed the catalog stages for a new project.
    async fn seed(&self, project_id: ResourceId, stages: &[StageSeed]) -> DbResult<()>;
    async fn get(&self, project_id: ResourceId, stage_name: &str) -> DbResult<StageRecord>;
    /// All stages of a project, ordered by stage number.
    async fn list(&self, project_id: ResourceId) -> DbResult<Vec<StageRecord>>;
    async fn update(
        &self,
        project_id: ResourceId,
        stage_name: &str,
        update: StageUpdate,
    ) -> DbResult<()>;
    /// Clear every stage at or after `stage_number` back to pending.
    async fn reset_from(&self, project_id: ResourceId, stage_number: i32) -> DbResult<()>;
}

/// PostgreSQL implementation of StageRepo.
pub struct PgStageRepo {
    pool: PgPool,
}

impl PgStageRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StageRepo for PgStageRepo {
    async fn seed(&self, project_id: ResourceId, stages: &[StageSeed]) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        for stage in stages {
            sqlx::query(
                r#"
                INSERT INTO stages (project_id, stage_name, stage_number,
                                    display_name, agent_name, status, created_at)
                VALUES ($1, $2, $3, $4, $5, 'pending', NOW())
                "#,
            )
            .bind(project_id.as_uuid())
            .bind(&stage.stage_name)
            .bind(stage.stage_number)
            .bind(&stage.display_name)
            .bind(&stage.agent_name)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, project_id: ResourceId, stage_name: &str) -> DbResult<StageRecord> {
        let row = sqlx::query_as::<_, StageRow>(
            "SELECT * FROM stages WHERE project_id = $1 AND stage_name = $2",
        )
        .bind(project_id.as_uuid())
        .bind(stage_name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("stage {}/{}", project_id, stage_name)))?;
        row.into_domain()
    }

    async fn list(&self, project_id: ResourceId) -> DbResult<Vec<StageRecord>> {
        let rows = sqlx::query_as::<_, StageRow>(
            "SELECT * FROM stages WHERE project_id = $1 ORDER BY stage_number",
        )
        .bind(project_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(StageRow::into_domain).collect()
    }

    async fn update(
        &self,
        project_id: ResourceId,
        stage_name: &str,
        update: StageUpdate,
    ) -> DbResult<()> {
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE stages SET stage_name = stage_name");

        if let Some(status) = update.status {
            qb.push(", status = ").push_bind(status.as_str());
        }
        if let Some(at) = update.started_at {
            qb.push(", started_at = ").push_bind(at);
        }
        if let Some(at) = update.completed_at {
            qb.push(", completed_at = ").push_bind(at);
        }
        if let Some(duration) = update.duration_seconds {
            qb.push(", duration_seconds = ").push_bind(duration);
        }
        if let Some(metrics) = update.metrics {
            let value = metrics.as_ref().map(serde_json::to_value).transpose()?;
            qb.push(", metrics = ").push_bind(value);
        }
        if let Some(content) = update.agent_output_content {
            qb.push(", agent_output_content = ").push_bind(content);
        }
        if let Some(blob_ref) = update.agent_output_blob_ref {
            qb.push(", agent_output_blob_ref = ").push_bind(blob_ref);
        }
        if let Some(document) = update.design_document {
            let value = document.as_ref().map(serde_json::to_value).transpose()?;
            qb.push(", design_document = ").push_bind(value);
        }
        if let Some(files) = update.generated_files {
            qb.push(", generated_files = ")
                .push_bind(serde_json::to_value(&files)?);
        }
        if let Some(message) = update.error_message {
            qb.push(", error_message = ").push_bind(message);
        }
        if let Some(path) = update.doc_path {
            qb.push(", doc_path = ").push_bind(path);
        }

        qb.push(" WHERE project_id = ").push_bind(*project_id.as_uuid());
        qb.push(" AND stage_name = ").push_bind(stage_name.to_string());
        let result = qb.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!(
                "stage {}/{}",
                project_id, stage_name
            )));
        }
        Ok(())
    }

    async fn reset_from(&self, project_id: ResourceId, stage_number: i32) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE stages
            SET status = 'pending', started_at = NULL, completed_at = NULL,
                duration_seconds = NULL, metrics = NULL,
                agent_output_content = NULL, agent_output_blob_ref = NULL,
                design_document = NULL, generated_files = '[]',
                error_message = NULL, doc_path = NULL
            WHERE project_id = $1 AND stage_number >= $2
            "#,
        )
        .bind(project_id.as_uuid())
        .bind(stage_number)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
