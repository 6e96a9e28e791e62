//! Application state.

use nexus_core::blob::BlobStore;
use nexus_db::{
    AgentRepo, FsBlobStore, PgAgentRepo, PgProjectRepo, PgStageRepo, PgTaskRepo, ProjectRepo,
    StageRepo, TaskQueue, TaskRepo, WorkQueue,
};
use nexus_engine::{ContextManager, WorkflowService};
use nexus_config::Settings;
use sqlx::PgPool;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub projects: Arc<dyn ProjectRepo>,
    pub stages: Arc<dyn StageRepo>,
    pub tasks: Arc<dyn TaskRepo>,
    pub agents: Arc<dyn AgentRepo>,
    pub workflow_service: Arc<WorkflowService>,
}

impl AppState {
    pub fn new(pool: PgPool, settings: Settings) -> Self {
        let projects: Arc<dyn ProjectRepo> = Arc::new(PgProjectRepo::new(pool.clone()));
        let stages: Arc<dyn StageRepo> = Arc::new(PgStageRepo::new(pool.clone()));
        let tasks: Arc<dyn TaskRepo> = Arc::new(PgTaskRepo::new(pool.clone()));
        let agents: Arc<dyn AgentRepo> = Arc::new(PgAgentRepo::new(pool.clone()));
        let queue: Arc<dyn WorkQueue> = Arc::new(TaskQueue::new(pool.clone()));
        let blob: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(
            settings.blob_root.clone(),
            &settings.blob_bucket,
        ));

        let context_manager = Arc::new(ContextManager::new(
            projects.clone(),
            stages.clone(),
            blob,
            settings.clone(),
        ));
        let workflow_service = Arc::new(WorkflowService::new(
            projects.clone(),
            stages.clone(),
            tasks.clone(),
            agents.clone(),
            queue,
            context_manager,
            settings,
        ));

        Self {
            pool,
            projects,
            stages,
            tasks,
            agents,
            workflow_service,
        }
    }
}
