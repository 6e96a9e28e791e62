//! Nexus worker binary.

use clap::Parser;
use nexus_core::blob::BlobStore;
use nexus_core::llm::LlmInvoker;
use nexus_db::{
    AgentRepo, FsBlobStore, PgAgentRepo, PgProjectRepo, PgStageRepo, PgTaskRepo, ProjectRepo,
    StageRepo, TaskQueue, TaskRepo, WorkQueue, create_pool,
};
use nexus_deployer::{AgentRuntime, DeploymentService, HttpAgentRuntime};
use nexus_engine::{ContextManager, FileMetadataManager, FileSyncManager};
use nexus_worker::{HttpLlmInvoker, Worker, WorkflowHandler};
use nexus_config::Settings;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "nexus-worker", about = "Nexus build worker")]
struct Args {
    /// Process only one message and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = Settings::from_env()?;

    info!("connecting to database...");
    let pool = create_pool(&settings.database_url).await?;
    info!("database connected");

    let projects: Arc<dyn ProjectRepo> = Arc::new(PgProjectRepo::new(pool.clone()));
    let stages: Arc<dyn StageRepo> = Arc::new(PgStageRepo::new(pool.clone()));
    let tasks: Arc<dyn TaskRepo> = Arc::new(PgTaskRepo::new(pool.clone()));
    let agents: Arc<dyn AgentRepo> = Arc::new(PgAgentRepo::new(pool.clone()));
    let queue: Arc<dyn WorkQueue> = Arc::new(TaskQueue::new(pool));
    let blob: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(
        settings.blob_root.clone(),
        &settings.blob_bucket,
    ));
    let invoker: Arc<dyn LlmInvoker> = Arc::new(HttpLlmInvoker::new(&settings.llm_endpoint));
    let runtime: Arc<dyn AgentRuntime> =
        Arc::new(HttpAgentRuntime::new(&settings.runtime_endpoint));

    let context_manager = Arc::new(ContextManager::new(
        projects.clone(),
        stages.clone(),
        blob.clone(),
        settings.clone(),
    ));
    let file_sync = Arc::new(FileSyncManager::new(
        blob.clone(),
        FileMetadataManager::new(stages.clone(), settings.projects_dir.clone()),
        settings.blob_prefix.clone(),
        settings.projects_dir.clone(),
    ));
    let deployment = Arc::new(DeploymentService::new(
        projects.clone(),
        stages.clone(),
        agents.clone(),
        runtime,
        file_sync.clone(),
        settings.clone(),
    ));

    let handler = Arc::new(WorkflowHandler::new(
        projects.clone(),
        stages,
        tasks.clone(),
        context_manager,
        invoker,
        file_sync,
        deployment,
        settings.worker_id.clone(),
    ));

    let worker = Worker::new(settings, queue, tasks, projects, handler);
    worker.install_signal_handlers();
    worker.run(args.once).await;
    Ok(())
}
