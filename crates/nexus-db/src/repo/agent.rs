//! Agent repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nexus_core::ResourceId;
use nexus_core::agent::{Agent, AgentStatus, DeploymentStatus, RuntimeHandles};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, sqlx::FromRow)]
struct AgentRow {
    agent_id: uuid::Uuid,
    agent_name: String,
    description: String,
    project_id: uuid::Uuid,
    status: String,
    deployment_status: String,
    runtime: serde_json::Value,
    capabilities: serde_json::Value,
    invocation_count: i64,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl AgentRow {
    fn into_domain(self) -> DbResult<Agent> {
        let status = AgentStatus::parse(&self.status)
            .ok_or_else(|| DbError::Corrupt(format!("agent status {}", self.status)))?;
        let deployment_status = DeploymentStatus::parse(&self.deployment_status).ok_or_else(
            || DbError::Corrupt(format!("deployment status {}", self.deployment_status)),
        )?;
        let runtime: RuntimeHandles = serde_json::from_value(self.runtime).unwrap_or_default();
        let capabilities: Vec<String> =
            serde_json::from_value(self.capabilities).unwrap_or_default();
        Ok(Agent {
            agent_id: ResourceId::from_uuid(self.agent_id),
            agent_name: self.agent_name,
            description: self.description,
            project_id: ResourceId::from_uuid(self.project_id),
            status,
            deployment_status,
            runtime,
            capabilities,
            invocation_count: self.invocation_count,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[async_trait]
pub trait AgentRepo: Send + Sync {
    /// Insert or replace the record for an agent id.
    async fn upsert(&self, agent: &Agent) -> DbResult<()>;
    async fn get(&self, id: ResourceId) -> DbResult<Agent>;
    async fn try_get(&self, id: ResourceId) -> DbResult<Option<Agent>>;
    async fn set_deployment_state(
        &self,
        id: ResourceId,
        status: AgentStatus,
        deployment_status: DeploymentStatus,
        runtime: Option<RuntimeHandles>,
        last_error: Option<String>,
    ) -> DbResult<()>;
}

/// PostgreSQL implementation of AgentRepo.
pub struct PgAgentRepo {
    pool: PgPool,
}

impl PgAgentRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AgentRepo for PgAgentRepo {
    async fn upsert(&self, agent: &Agent) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO agents (agent_id, agent_name, description, project_id,
                                status, deployment_status, runtime, capabilities,
                                invocation_count, last_error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW(), NOW())
            ON CONFLICT (agent_id) DO UPDATE SET
                agent_name = EXCLUDED.agent_name,
                description = EXCLUDED.description,
                project_id = EXCLUDED.project_id,
                status = EXCLUDED.status,
                deployment_status = EXCLUDED.deployment_status,
                runtime = EXCLUDED.runtime,
                capabilities = EXCLUDED.capabilities,
                last_error = EXCLUDED.last_error,
                updated_at = NOW()
            "#,
        )
        .bind(agent.agent_id.as_uuid())
        .bind(&agent.agent_name)
        .bind(&agent.description)
        .bind(agent.project_id.as_uuid())
        .bind(agent.status.as_str())
        .bind(agent.deployment_status.as_str())
        .bind(serde_json::to_value(&agent.runtime)?)
        .bind(serde_json::to_value(&agent.capabilities)?)
        .bind(agent.invocation_count)
        .bind(&agent.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: ResourceId) -> DbResult<Agent> {
        self.try_get(id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("agent {}", id)))
    }

    async fn try_get(&self, id: ResourceId) -> DbResult<Option<Agent>> {
        let row = sqlx::query_as::<_, AgentRow>("SELECT * FROM agents WHERE agent_id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(AgentRow::into_domain).transpose()
    }

    async fn set_deployment_state(
        &self,
        id: ResourceId,
        status: AgentStatus,
        deployment_status: DeploymentStatus,
        runtime: Option<RuntimeHandles>,
        last_error: Option<String>,
    ) -> DbResult<()> {
        let runtime_value = runtime.as_ref().map(serde_json::to_value).transpose()?;
        sqlx::query(
            r#"
            UPDATE agents
            SET status = $2, deployment_status = $3,
                runtime = COALESCE($4, runtime),
                last_error = $5, updated_at = NOW()
            WHERE agent_id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(deployment_status.as_str())
        .bind(runtime_value)
        .bind(last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
