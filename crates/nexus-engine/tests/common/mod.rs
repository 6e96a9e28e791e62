//! In-memory test doubles for the engine and service suites.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use nexus_core::ResourceId;
use nexus_core::agent::Agent;
use nexus_core::blob::BlobStore;
use nexus_core::llm::{LlmInvoker, LlmRequest, LlmResponse};
use nexus_core::project::{ControlStatus, Project, ProjectStatus, WorkflowType};
use nexus_core::stage::{StageRecord, StageStatus};
use nexus_core::task::{Task, TaskStatus};
use nexus_db::{
    AgentRepo, DbError, DbResult, FsBlobStore, ProjectRepo, ProjectUpdate, QueueMessage,
    StageRepo, StageSeed, StageUpdate, TaskRepo, WorkQueue,
};
use nexus_config::{Settings, workflow_catalog};
use nexus_engine::ContextManager;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct MemProjectRepo {
    projects: Mutex<HashMap<uuid::Uuid, Project>>,
}

impl MemProjectRepo {
    /// Control writes land on a separate path in production; tests
    /// use this to simulate one arriving mid-stage.
    pub fn set_control(&self, id: ResourceId, control: ControlStatus) {
        let mut projects = self.projects.lock().unwrap();
        if let Some(project) = projects.get_mut(id.as_uuid()) {
            project.control_status = control;
        }
    }

    pub fn snapshot(&self, id: ResourceId) -> Option<Project> {
        self.projects.lock().unwrap().get(id.as_uuid()).cloned()
    }
}

#[async_trait]
impl ProjectRepo for MemProjectRepo {
    async fn create(&self, project: &Project) -> DbResult<()> {
        self.projects
            .lock()
            .unwrap()
            .insert(*project.project_id.as_uuid(), project.clone());
        Ok(())
    }

    async fn get(&self, id: ResourceId) -> DbResult<Project> {
        self.try_get(id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("project {id}")))
    }

    async fn try_get(&self, id: ResourceId) -> DbResult<Option<Project>> {
        Ok(self.projects.lock().unwrap().get(id.as_uuid()).cloned())
    }

    async fn update(&self, id: ResourceId, update: ProjectUpdate) -> DbResult<()> {
        let mut projects = self.projects.lock().unwrap();
        let project = projects
            .get_mut(id.as_uuid())
            .ok_or_else(|| DbError::NotFound(format!("project {id}")))?;
        if let Some(name) = update.project_name {
            project.project_name = name;
        }
        if let Some(status) = update.status {
            project.status = status;
        }
        if let Some(control) = update.control_status {
            project.control_status = control;
        }
        if let Some(stage) = update.current_stage {
            project.current_stage = stage;
        }
        if let Some(progress) = update.progress {
            project.progress = progress;
        }
        if let Some(error_info) = update.error_info {
            project.error_info = error_info;
        }
        if let Some(metrics) = update.aggregated_metrics {
            project.aggregated_metrics = metrics;
        }
        if let Some(at) = update.pause_requested_at {
            project.pause_requested_at = at;
        }
        if let Some(at) = update.stop_requested_at {
            project.stop_requested_at = at;
        }
        if let Some(stage) = update.resume_from_stage {
            project.resume_from_stage = stage;
        }
        if let Some(tags) = update.tags {
            project.tags = tags;
        }
        if let Some(at) = update.started_at {
            project.started_at = Some(at);
        }
        if let Some(at) = update.completed_at {
            project.completed_at = at;
        }
        project.updated_at = Utc::now();
        Ok(())
    }

    async fn list_by_status(
        &self,
        status: ProjectStatus,
        limit: i64,
    ) -> DbResult<Vec<Project>> {
        Ok(self
            .projects
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.status == status)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemStageRepo {
    stages: Mutex<HashMap<(uuid::Uuid, String), StageRecord>>,
}

impl MemStageRepo {
    pub fn snapshot(&self, project_id: ResourceId, stage_name: &str) -> Option<StageRecord> {
        self.stages
            .lock()
            .unwrap()
            .get(&(*project_id.as_uuid(), stage_name.to_string()))
            .cloned()
    }
}

fn apply_stage_update(record: &mut StageRecord, update: StageUpdate) {
    if let Some(status) = update.status {
        record.status = status;
    }
    if let Some(at) = update.started_at {
        record.started_at = at;
    }
    if let Some(at) = update.completed_at {
        record.completed_at = at;
    }
    if let Some(duration) = update.duration_seconds {
        record.duration_seconds = duration;
    }
    if let Some(metrics) = update.metrics {
        record.metrics = metrics;
    }
    if let Some(content) = update.agent_output_content {
        record.agent_output_content = content;
    }
    if let Some(blob_ref) = update.agent_output_blob_ref {
        record.agent_output_blob_ref = blob_ref;
    }
    if let Some(document) = update.design_document {
        record.design_document = document;
    }
    if let Some(files) = update.generated_files {
        record.generated_files = files;
    }
    if let Some(message) = update.error_message {
        record.error_message = message;
    }
    if let Some(path) = update.doc_path {
        record.doc_path = path;
    }
}

#[async_trait]
impl StageRepo for MemStageRepo {
    async fn seed(&self, project_id: ResourceId, seeds: &[StageSeed]) -> DbResult<()> {
        let mut stages = self.stages.lock().unwrap();
        for seed in seeds {
            stages.insert(
                (*project_id.as_uuid(), seed.stage_name.clone()),
                StageRecord {
                    project_id,
                    stage_name: seed.stage_name.clone(),
                    stage_number: seed.stage_number,
                    display_name: seed.display_name.clone(),
                    agent_name: seed.agent_name.clone(),
                    status: StageStatus::Pending,
                    started_at: None,
                    completed_at: None,
                    duration_seconds: None,
                    metrics: None,
                    agent_output_content: None,
                    agent_output_blob_ref: None,
                    design_document: None,
                    generated_files: Vec::new(),
                    error_message: None,
                    doc_path: None,
                    created_at: Utc::now(),
                },
            );
        }
        Ok(())
    }

    async fn get(&self, project_id: ResourceId, stage_name: &str) -> DbResult<StageRecord> {
        self.stages
            .lock()
            .unwrap()
            .get(&(*project_id.as_uuid(), stage_name.to_string()))
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("stage {project_id}/{stage_name}")))
    }

    async fn list(&self, project_id: ResourceId) -> DbResult<Vec<StageRecord>> {
        let mut records: Vec<StageRecord> = self
            .stages
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.project_id == project_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.stage_number);
        Ok(records)
    }

    async fn update(
        &self,
        project_id: ResourceId,
        stage_name: &str,
        update: StageUpdate,
    ) -> DbResult<()> {
        let mut stages = self.stages.lock().unwrap();
        let record = stages
            .get_mut(&(*project_id.as_uuid(), stage_name.to_string()))
            .ok_or_else(|| DbError::NotFound(format!("stage {project_id}/{stage_name}")))?;
        apply_stage_update(record, update);
        Ok(())
    }

    async fn reset_from(&self, project_id: ResourceId, stage_number: i32) -> DbResult<()> {
        let mut stages = self.stages.lock().unwrap();
        for record in stages.values_mut() {
            if record.project_id == project_id && record.stage_number >= stage_number {
                apply_stage_update(record, StageUpdate::cleared());
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemTaskRepo {
    tasks: Mutex<HashMap<uuid::Uuid, Task>>,
}

impl MemTaskRepo {
    pub fn snapshot(&self, id: ResourceId) -> Option<Task> {
        self.tasks.lock().unwrap().get(id.as_uuid()).cloned()
    }
}

#[async_trait]
impl TaskRepo for MemTaskRepo {
    async fn create(&self, task: &Task) -> DbResult<()> {
        self.tasks
            .lock()
            .unwrap()
            .insert(*task.task_id.as_uuid(), task.clone());
        Ok(())
    }

    async fn get(&self, id: ResourceId) -> DbResult<Task> {
        self.tasks
            .lock()
            .unwrap()
            .get(id.as_uuid())
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("task {id}")))
    }

    async fn set_status(&self, id: ResourceId, status: TaskStatus) -> DbResult<()> {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(task) = tasks.get_mut(id.as_uuid()) {
            task.status = status;
        }
        Ok(())
    }

    async fn mark_running(&self, id: ResourceId, worker_id: &str) -> DbResult<()> {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(task) = tasks.get_mut(id.as_uuid()) {
            task.status = TaskStatus::Running;
            task.worker_id = Some(worker_id.to_string());
            task.started_at.get_or_insert_with(Utc::now);
        }
        Ok(())
    }

    async fn finish(
        &self,
        id: ResourceId,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
    ) -> DbResult<()> {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(task) = tasks.get_mut(id.as_uuid()) {
            task.status = status;
            if result.is_some() {
                task.result = result;
            }
            task.error_message = error_message;
            if status.is_terminal() {
                task.completed_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn increment_retry(&self, id: ResourceId) -> DbResult<i32> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .get_mut(id.as_uuid())
            .ok_or_else(|| DbError::NotFound(format!("task {id}")))?;
        task.retry_count += 1;
        Ok(task.retry_count)
    }
}

#[derive(Default)]
pub struct MemAgentRepo {
    agents: Mutex<HashMap<uuid::Uuid, Agent>>,
}

impl MemAgentRepo {
    pub fn snapshot(&self, id: ResourceId) -> Option<Agent> {
        self.agents.lock().unwrap().get(id.as_uuid()).cloned()
    }
}

#[async_trait]
impl AgentRepo for MemAgentRepo {
    async fn upsert(&self, agent: &Agent) -> DbResult<()> {
        self.agents
            .lock()
            .unwrap()
            .insert(*agent.agent_id.as_uuid(), agent.clone());
        Ok(())
    }

    async fn get(&self, id: ResourceId) -> DbResult<Agent> {
        self.try_get(id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("agent {id}")))
    }

    async fn try_get(&self, id: ResourceId) -> DbResult<Option<Agent>> {
        Ok(self.agents.lock().unwrap().get(id.as_uuid()).cloned())
    }

    async fn set_deployment_state(
        &self,
        id: ResourceId,
        status: nexus_core::agent::AgentStatus,
        deployment_status: nexus_core::agent::DeploymentStatus,
        runtime: Option<nexus_core::agent::RuntimeHandles>,
        last_error: Option<String>,
    ) -> DbResult<()> {
        let mut agents = self.agents.lock().unwrap();
        if let Some(agent) = agents.get_mut(id.as_uuid()) {
            agent.status = status;
            agent.deployment_status = deployment_status;
            if let Some(runtime) = runtime {
                agent.runtime = runtime;
            }
            agent.last_error = last_error;
        }
        Ok(())
    }
}

/// Unleased-message queue double: `receive` hands out messages in
/// send order and stamps a lease the way the real queue does.
#[derive(Default)]
pub struct MemQueue {
    messages: Mutex<Vec<QueueMessage>>,
}

impl MemQueue {
    pub fn pending(&self, queue_name: &str) -> Vec<QueueMessage> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.queue_name == queue_name)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl WorkQueue for MemQueue {
    async fn send(
        &self,
        queue_name: &str,
        body: serde_json::Value,
        attributes: HashMap<String, String>,
        priority: i32,
    ) -> DbResult<uuid::Uuid> {
        let id = uuid::Uuid::now_v7();
        self.messages.lock().unwrap().push(QueueMessage {
            id,
            queue_name: queue_name.to_string(),
            body,
            attributes: serde_json::to_value(attributes)?,
            priority,
            leased_by: None,
            lease_expires_at: None,
            receive_count: 0,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn receive(
        &self,
        queue_name: &str,
        worker_id: &str,
        _wait: Duration,
        visibility: Duration,
    ) -> DbResult<Option<QueueMessage>> {
        let now = Utc::now();
        let mut messages = self.messages.lock().unwrap();
        let claimable = messages.iter_mut().find(|m| {
            m.queue_name == queue_name
                && m.lease_expires_at.map(|at| at < now).unwrap_or(true)
        });
        Ok(claimable.map(|m| {
            m.leased_by = Some(worker_id.to_string());
            m.lease_expires_at =
                Some(now + chrono::Duration::from_std(visibility).unwrap_or_default());
            m.receive_count += 1;
            m.clone()
        }))
    }

    async fn extend_lease(
        &self,
        message_id: uuid::Uuid,
        worker_id: &str,
        visibility: Duration,
    ) -> DbResult<()> {
        let mut messages = self.messages.lock().unwrap();
        let message = messages
            .iter_mut()
            .find(|m| m.id == message_id && m.leased_by.as_deref() == Some(worker_id))
            .ok_or_else(|| DbError::NotFound(format!("lease {message_id}")))?;
        message.lease_expires_at =
            Some(Utc::now() + chrono::Duration::from_std(visibility).unwrap_or_default());
        Ok(())
    }

    async fn delete(&self, message_id: uuid::Uuid, worker_id: &str) -> DbResult<()> {
        let mut messages = self.messages.lock().unwrap();
        let before = messages.len();
        messages.retain(|m| !(m.id == message_id && m.leased_by.as_deref() == Some(worker_id)));
        if messages.len() == before {
            return Err(DbError::NotFound(format!("message {message_id}")));
        }
        Ok(())
    }

    async fn release(&self, message_id: uuid::Uuid) -> DbResult<()> {
        let mut messages = self.messages.lock().unwrap();
        if let Some(message) = messages.iter_mut().find(|m| m.id == message_id) {
            message.leased_by = None;
            message.lease_expires_at = None;
        }
        Ok(())
    }
}

type InvokeHook = Box<dyn Fn(&str) + Send + Sync>;

/// Scripted LLM invoker. Responses key off the stage name at the end
/// of the prompt template path.
#[derive(Default)]
pub struct MockInvoker {
    pub calls: Mutex<Vec<LlmRequest>>,
    responses: Mutex<HashMap<String, String>>,
    fail_once: Mutex<Vec<String>>,
    on_invoke: Mutex<Option<InvokeHook>>,
}

impl MockInvoker {
    pub fn respond_with(&self, stage: &str, text: impl Into<String>) {
        self.responses
            .lock()
            .unwrap()
            .insert(stage.to_string(), text.into());
    }

    pub fn fail_once(&self, stage: &str) {
        self.fail_once.lock().unwrap().push(stage.to_string());
    }

    pub fn on_invoke(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_invoke.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn calls_for(&self, stage: &str) -> Vec<LlmRequest> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.template.ends_with(stage))
            .cloned()
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmInvoker for MockInvoker {
    async fn invoke(&self, request: LlmRequest) -> nexus_core::Result<LlmResponse> {
        let stage = request
            .template
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        self.calls.lock().unwrap().push(request);

        if let Some(hook) = &*self.on_invoke.lock().unwrap() {
            hook(&stage);
        }

        {
            let mut fail_once = self.fail_once.lock().unwrap();
            if let Some(index) = fail_once.iter().position(|s| s == &stage) {
                fail_once.remove(index);
                return Err(nexus_core::Error::InvocationFailed(format!(
                    "transient model failure in {stage}"
                )));
            }
        }

        let text = self
            .responses
            .lock()
            .unwrap()
            .get(&stage)
            .cloned()
            .unwrap_or_else(|| format!("# {stage}\noutput for {stage}"));
        Ok(LlmResponse {
            text,
            input_tokens: 120,
            output_tokens: 45,
            tool_calls: Vec::new(),
            model_id: Some("nexus-model-1".to_string()),
        })
    }
}

/// Everything an engine/service test needs, wired over the in-memory
/// doubles and a tempdir-backed blob store.
pub struct Harness {
    pub projects: Arc<MemProjectRepo>,
    pub stages: Arc<MemStageRepo>,
    pub tasks: Arc<MemTaskRepo>,
    pub agents: Arc<MemAgentRepo>,
    pub queue: Arc<MemQueue>,
    pub blob: Arc<dyn BlobStore>,
    pub invoker: Arc<MockInvoker>,
    pub context_manager: Arc<ContextManager>,
    pub settings: Settings,
    _tmp: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.projects_dir = tmp.path().join("projects");
        settings.rules_path = tmp.path().join("rules.yaml");
        std::fs::create_dir_all(&settings.projects_dir).unwrap();
        std::fs::write(&settings.rules_path, "rule: build carefully\n").unwrap();

        let projects = Arc::new(MemProjectRepo::default());
        let stages = Arc::new(MemStageRepo::default());
        let tasks = Arc::new(MemTaskRepo::default());
        let agents = Arc::new(MemAgentRepo::default());
        let queue = Arc::new(MemQueue::default());
        let blob: Arc<dyn BlobStore> =
            Arc::new(FsBlobStore::new(tmp.path().join("blob"), &settings.blob_bucket));
        let invoker = Arc::new(MockInvoker::default());

        let context_manager = Arc::new(ContextManager::new(
            projects.clone() as Arc<dyn ProjectRepo>,
            stages.clone() as Arc<dyn StageRepo>,
            blob.clone(),
            settings.clone(),
        ));

        Self {
            projects,
            stages,
            tasks,
            agents,
            queue,
            blob,
            invoker,
            context_manager,
            settings,
            _tmp: tmp,
        }
    }

    /// Create a queued project with its catalog stages pre-seeded,
    /// the way the workflow service does at creation time.
    pub async fn seed_project(&self, workflow_type: WorkflowType) -> ResourceId {
        let project_id = ResourceId::new();
        let now = Utc::now();
        let project = Project {
            project_id,
            project_name: format!("project_{}", project_id.short()),
            workflow_type,
            requirement: "Build an AWS pricing agent".to_string(),
            status: ProjectStatus::Queued,
            control_status: ControlStatus::Running,
            current_stage: None,
            progress: 0.0,
            priority: 3,
            tags: Vec::new(),
            user_id: None,
            error_info: None,
            aggregated_metrics: Default::default(),
            pause_requested_at: None,
            stop_requested_at: None,
            resume_from_stage: None,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        self.projects.create(&project).await.unwrap();

        let catalog = workflow_catalog(workflow_type);
        let seeds: Vec<StageSeed> = catalog
            .stages
            .iter()
            .map(|s| StageSeed {
                stage_name: s.name.as_str().to_string(),
                stage_number: s.order,
                display_name: s.display_name.to_string(),
                agent_name: Some(s.agent_name.to_string()),
            })
            .collect();
        self.stages.seed(project_id, &seeds).await.unwrap();
        project_id
    }
}
