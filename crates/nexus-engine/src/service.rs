//! Workflow service.
//!
//! The factory and control path: creates projects with pre-seeded
//! stages and queued tasks, and applies pause/resume/stop/cancel/
//! restart transitions. The engine only ever reads the control state
//! this service writes.

use chrono::Utc;
use nexus_core::ResourceId;
use nexus_core::project::{
    ControlStatus, ErrorInfo, Project, ProjectStatus, WorkflowType,
};
use nexus_core::stage::StageRecord;
use nexus_core::task::{Task, TaskAction, TaskMessage, TaskStatus, TaskType};
use nexus_db::{
    AgentRepo, ProjectRepo, ProjectUpdate, StageRepo, StageSeed, TaskRepo, WorkQueue,
};
use nexus_config::{Settings, normalize_stage_name, workflow_catalog};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

use crate::context::ContextManager;
use crate::{EngineError, EngineResult};

fn default_priority() -> i32 {
    3
}

/// Body of `POST /projects`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateProjectRequest {
    pub requirement: String,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Body of `POST /workflows/agent-update`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentUpdateRequest {
    pub agent_id: ResourceId,
    pub update_requirement: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: i32,
}

/// Body of `POST /workflows/tool-build`.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolBuildRequest {
    pub requirement: String,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub target_agent: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// What project creation returns to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedProject {
    pub project_id: ResourceId,
    pub task_id: ResourceId,
    pub project_name: String,
    pub workflow_type: WorkflowType,
    pub status: ProjectStatus,
    pub stages: Vec<String>,
}

/// Result of a control operation.
#[derive(Debug, Clone, Serialize)]
pub struct ControlResult {
    pub project_id: ResourceId,
    pub action: String,
    pub previous_status: ProjectStatus,
    pub new_status: ProjectStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<ResourceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_stage: Option<String>,
}

/// Derived view for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStatusView {
    pub project_id: ResourceId,
    pub workflow_type: WorkflowType,
    pub status: ProjectStatus,
    pub control_status: ControlStatus,
    pub current_stage: Option<String>,
    pub completed_stages: Vec<String>,
    pub pending_stages: Vec<String>,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
    pub aggregated_metrics: nexus_core::project::AggregatedMetrics,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// A stage's output as served to API callers, blob-dereferenced.
#[derive(Debug, Clone, Serialize)]
pub struct StageOutputView {
    pub stage_name: String,
    pub status: nexus_core::stage::StageStatus,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Creates and controls workflow projects.
pub struct WorkflowService {
    projects: Arc<dyn ProjectRepo>,
    stages: Arc<dyn StageRepo>,
    tasks: Arc<dyn TaskRepo>,
    agents: Arc<dyn AgentRepo>,
    queue: Arc<dyn WorkQueue>,
    context_manager: Arc<ContextManager>,
    settings: Settings,
}

impl WorkflowService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        projects: Arc<dyn ProjectRepo>,
        stages: Arc<dyn StageRepo>,
        tasks: Arc<dyn TaskRepo>,
        agents: Arc<dyn AgentRepo>,
        queue: Arc<dyn WorkQueue>,
        context_manager: Arc<ContextManager>,
        settings: Settings,
    ) -> Self {
        Self {
            projects,
            stages,
            tasks,
            agents,
            queue,
            context_manager,
            settings,
        }
    }

    fn validate_priority(priority: i32) -> EngineResult<()> {
        if !(1..=5).contains(&priority) {
            return Err(EngineError::InvalidInput(format!(
                "priority must be within 1..=5, got {priority}"
            )));
        }
        Ok(())
    }

    /// Temporary name used until the build decides the real one.
    fn generate_project_name(requirement: &str) -> String {
        let stamp = Utc::now().format("%m%d%H%M");
        let digest = hex::encode(md5::compute(requirement.as_bytes()).0);
        format!("agent_{stamp}_{}", &digest[..6])
    }

    /// Create a build project: record, pre-seeded stages, task, queue
    /// message, then flip project and task to queued.
    pub async fn create_build_project(
        &self,
        request: CreateProjectRequest,
    ) -> EngineResult<CreatedProject> {
        if request.requirement.trim().is_empty() {
            return Err(EngineError::InvalidInput("requirement is required".into()));
        }
        Self::validate_priority(request.priority)?;

        let project_name = request
            .project_name
            .clone()
            .unwrap_or_else(|| Self::generate_project_name(&request.requirement));
        let mut metadata = HashMap::new();
        metadata.insert(
            "project_name".to_string(),
            serde_json::Value::String(project_name.clone()),
        );

        self.create_project_common(
            WorkflowType::AgentBuild,
            TaskType::BuildAgent,
            project_name,
            request.requirement,
            request.user_id,
            request.priority,
            request.tags,
            metadata,
        )
        .await
    }

    /// Create an update project for an existing deployed agent.
    pub async fn create_agent_update_project(
        &self,
        request: AgentUpdateRequest,
    ) -> EngineResult<CreatedProject> {
        if request.update_requirement.trim().is_empty() {
            return Err(EngineError::InvalidInput(
                "update_requirement is required".into(),
            ));
        }
        Self::validate_priority(request.priority)?;

        let agent = self
            .agents
            .try_get(request.agent_id)
            .await?
            .ok_or_else(|| {
                EngineError::InvalidInput(format!("agent {} not found", request.agent_id))
            })?;

        let project_name = format!(
            "update_{}_{}",
            agent.agent_name,
            Utc::now().format("%Y-%m-%d")
        );
        let mut metadata = HashMap::new();
        metadata.insert(
            "agent_id".to_string(),
            serde_json::Value::String(agent.agent_id.to_string()),
        );
        metadata.insert(
            "agent_name".to_string(),
            serde_json::Value::String(agent.agent_name.clone()),
        );
        metadata.insert(
            "original_project_id".to_string(),
            serde_json::Value::String(agent.project_id.to_string()),
        );

        self.create_project_common(
            WorkflowType::AgentUpdate,
            TaskType::UpdateAgent,
            project_name,
            request.update_requirement,
            request.user_id,
            request.priority,
            Vec::new(),
            metadata,
        )
        .await
    }

    /// Create a tool-build project.
    pub async fn create_tool_build_project(
        &self,
        request: ToolBuildRequest,
    ) -> EngineResult<CreatedProject> {
        if request.requirement.trim().is_empty() {
            return Err(EngineError::InvalidInput("requirement is required".into()));
        }
        Self::validate_priority(request.priority)?;

        let project_id_hint = ResourceId::new();
        let tool_name = request
            .tool_name
            .clone()
            .unwrap_or_else(|| format!("tool_{}", project_id_hint.short()));

        let mut metadata = HashMap::new();
        metadata.insert(
            "tool_name".to_string(),
            serde_json::Value::String(tool_name.clone()),
        );
        if let Some(category) = &request.category {
            metadata.insert(
                "category".to_string(),
                serde_json::Value::String(category.clone()),
            );
        }
        if let Some(target_agent) = &request.target_agent {
            metadata.insert(
                "target_agent".to_string(),
                serde_json::Value::String(target_agent.clone()),
            );
        }

        self.create_project_common(
            WorkflowType::ToolBuild,
            TaskType::BuildTool,
            tool_name,
            request.requirement,
            request.user_id,
            request.priority,
            request.tags,
            metadata,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_project_common(
        &self,
        workflow_type: WorkflowType,
        task_type: TaskType,
        project_name: String,
        requirement: String,
        user_id: Option<String>,
        priority: i32,
        tags: Vec<String>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> EngineResult<CreatedProject> {
        let project_id = ResourceId::new();
        let task_id = ResourceId::new();
        let now = Utc::now();

        let project = Project {
            project_id,
            project_name: project_name.clone(),
            workflow_type,
            requirement: requirement.clone(),
            status: ProjectStatus::Pending,
            control_status: ControlStatus::Running,
            current_stage: None,
            progress: 0.0,
            priority,
            tags,
            user_id: user_id.clone(),
            error_info: None,
            aggregated_metrics: Default::default(),
            pause_requested_at: None,
            stop_requested_at: None,
            resume_from_stage: None,
            metadata: metadata.clone(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        self.projects.create(&project).await?;
        info!(project_id = %project_id, workflow = %workflow_type, "created project");

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
        self.stages.seed(project_id, &seeds).await?;

        let message = TaskMessage {
            task_id,
            project_id,
            task_type,
            workflow_type,
            requirement,
            user_id,
            priority,
            action: TaskAction::Execute,
            target_stage: None,
            execute_to_completion: true,
            metadata,
        };

        let task = Task {
            task_id,
            task_type,
            project_id,
            status: TaskStatus::Pending,
            priority,
            payload: serde_json::to_value(&message).map_err(nexus_db::DbError::from)?,
            result: None,
            error_message: None,
            retry_count: 0,
            worker_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        self.tasks.create(&task).await?;

        if let Err(e) = self.enqueue(&message).await {
            error!(project_id = %project_id, error = %e, "failed to enqueue build task");
            self.projects
                .update(
                    project_id,
                    ProjectUpdate {
                        status: Some(ProjectStatus::Failed),
                        error_info: Some(Some(ErrorInfo::new(format!(
                            "failed to queue task: {e}"
                        )))),
                        ..Default::default()
                    },
                )
                .await?;
            self.tasks
                .finish(task_id, TaskStatus::Failed, None, Some(e.to_string()))
                .await?;
            return Err(e);
        }

        self.projects
            .update(project_id, ProjectUpdate::status(ProjectStatus::Queued))
            .await?;
        self.tasks.set_status(task_id, TaskStatus::Queued).await?;

        Ok(CreatedProject {
            project_id,
            task_id,
            project_name,
            workflow_type,
            status: ProjectStatus::Queued,
            stages: catalog.stage_names(),
        })
    }

    async fn enqueue(&self, message: &TaskMessage) -> EngineResult<()> {
        let mut attributes = HashMap::new();
        attributes.insert(
            "task_type".to_string(),
            message.task_type.as_str().to_string(),
        );
        attributes.insert(
            "workflow_type".to_string(),
            message.workflow_type.as_str().to_string(),
        );
        attributes.insert("priority".to_string(), message.priority.to_string());
        self.queue
            .send(
                &self.settings.build_queue,
                serde_json::to_value(message).map_err(nexus_db::DbError::from)?,
                attributes,
                message.priority,
            )
            .await?;
        Ok(())
    }

    /// Pause a building or queued project. The engine yields after
    /// the stage currently in flight.
    pub async fn pause(&self, project_id: ResourceId) -> EngineResult<ControlResult> {
        let project = self.projects.get(project_id).await?;
        if !matches!(
            project.status,
            ProjectStatus::Building | ProjectStatus::Queued
        ) {
            return Err(EngineError::InvalidTransition(format!(
                "cannot pause project in {} status",
                project.status
            )));
        }
        self.projects
            .update(
                project_id,
                ProjectUpdate {
                    status: Some(ProjectStatus::Paused),
                    control_status: Some(ControlStatus::Paused),
                    pause_requested_at: Some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await?;
        info!(project_id = %project_id, "project paused");
        Ok(ControlResult {
            project_id,
            action: "pause".into(),
            previous_status: project.status,
            new_status: ProjectStatus::Paused,
            task_id: None,
            target_stage: None,
        })
    }

    /// Resume a paused project: compute the target stage, clear the
    /// pause state (including `resume_from_stage`, which the enqueued
    /// message now carries) and queue a resume task.
    pub async fn resume(&self, project_id: ResourceId) -> EngineResult<ControlResult> {
        let project = self.projects.get(project_id).await?;
        if project.status != ProjectStatus::Paused {
            return Err(EngineError::InvalidTransition(format!(
                "cannot resume project in {} status",
                project.status
            )));
        }

        let mut target_stage = project
            .resume_from_stage
            .clone()
            .or_else(|| project.current_stage.clone());
        if target_stage.is_none() {
            let records = self.stages.list(project_id).await?;
            target_stage = records
                .iter()
                .find(|r| r.status != nexus_core::stage::StageStatus::Completed)
                .map(|r| r.stage_name.clone());
        }

        self.projects
            .update(
                project_id,
                ProjectUpdate {
                    status: Some(ProjectStatus::Queued),
                    control_status: Some(ControlStatus::Running),
                    pause_requested_at: Some(None),
                    stop_requested_at: Some(None),
                    resume_from_stage: Some(None),
                    ..Default::default()
                },
            )
            .await?;

        let task_id = self
            .enqueue_control_task(&project, TaskAction::Resume, target_stage.clone())
            .await?;

        info!(project_id = %project_id, ?target_stage, "project resume queued");
        Ok(ControlResult {
            project_id,
            action: "resume".into(),
            previous_status: project.status,
            new_status: ProjectStatus::Queued,
            task_id: Some(task_id),
            target_stage,
        })
    }

    /// Stop a project: the run exits after the current stage and the
    /// project lands cancelled.
    pub async fn stop(&self, project_id: ResourceId) -> EngineResult<ControlResult> {
        let project = self.projects.get(project_id).await?;
        if !matches!(
            project.status,
            ProjectStatus::Building | ProjectStatus::Queued | ProjectStatus::Paused
        ) {
            return Err(EngineError::InvalidTransition(format!(
                "cannot stop project in {} status",
                project.status
            )));
        }
        self.projects
            .update(
                project_id,
                ProjectUpdate {
                    status: Some(ProjectStatus::Cancelled),
                    control_status: Some(ControlStatus::Stopped),
                    stop_requested_at: Some(Some(Utc::now())),
                    completed_at: Some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await?;
        info!(project_id = %project_id, "project stopped");
        Ok(ControlResult {
            project_id,
            action: "stop".into(),
            previous_status: project.status,
            new_status: ProjectStatus::Cancelled,
            task_id: None,
            target_stage: None,
        })
    }

    /// Cancel a project; no further tasks are honored.
    pub async fn cancel(&self, project_id: ResourceId) -> EngineResult<ControlResult> {
        let project = self.projects.get(project_id).await?;
        if !matches!(
            project.status,
            ProjectStatus::Building | ProjectStatus::Queued | ProjectStatus::Paused
        ) {
            return Err(EngineError::InvalidTransition(format!(
                "cannot cancel project in {} status",
                project.status
            )));
        }
        self.projects
            .update(
                project_id,
                ProjectUpdate {
                    status: Some(ProjectStatus::Cancelled),
                    control_status: Some(ControlStatus::Cancelled),
                    completed_at: Some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await?;
        info!(project_id = %project_id, "project cancelled");
        Ok(ControlResult {
            project_id,
            action: "cancel".into(),
            previous_status: project.status,
            new_status: ProjectStatus::Cancelled,
            task_id: None,
            target_stage: None,
        })
    }

    /// Restart from a stage: clear it and everything after it back to
    /// pending, unconditionally overwrite `resume_from_stage`, and
    /// queue a restart task.
    pub async fn restart_from_stage(
        &self,
        project_id: ResourceId,
        from_stage: &str,
    ) -> EngineResult<ControlResult> {
        let project = self.projects.get(project_id).await?;
        if !matches!(
            project.status,
            ProjectStatus::Completed
                | ProjectStatus::Failed
                | ProjectStatus::Cancelled
                | ProjectStatus::Paused
        ) {
            return Err(EngineError::InvalidTransition(format!(
                "cannot restart project in {} status",
                project.status
            )));
        }

        let stage = normalize_stage_name(from_stage)
            .ok_or_else(|| EngineError::UnknownStage(from_stage.to_string()))?;
        let catalog = workflow_catalog(project.workflow_type);
        let spec = catalog
            .stage(stage)
            .ok_or_else(|| EngineError::UnknownStage(from_stage.to_string()))?;

        self.stages.reset_from(project_id, spec.order).await?;
        self.projects
            .update(
                project_id,
                ProjectUpdate {
                    status: Some(ProjectStatus::Queued),
                    control_status: Some(ControlStatus::Running),
                    resume_from_stage: Some(Some(stage.as_str().to_string())),
                    error_info: Some(None),
                    completed_at: Some(None),
                    ..Default::default()
                },
            )
            .await?;

        let task_id = self
            .enqueue_control_task(
                &project,
                TaskAction::Restart,
                Some(stage.as_str().to_string()),
            )
            .await?;

        info!(project_id = %project_id, from_stage = %stage, "project restart queued");
        Ok(ControlResult {
            project_id,
            action: "restart".into(),
            previous_status: project.status,
            new_status: ProjectStatus::Queued,
            task_id: Some(task_id),
            target_stage: Some(stage.as_str().to_string()),
        })
    }

    async fn enqueue_control_task(
        &self,
        project: &Project,
        action: TaskAction,
        target_stage: Option<String>,
    ) -> EngineResult<ResourceId> {
        let task_id = ResourceId::new();
        let task_type = match project.workflow_type {
            WorkflowType::AgentBuild => TaskType::BuildAgent,
            WorkflowType::AgentUpdate => TaskType::UpdateAgent,
            WorkflowType::ToolBuild => TaskType::BuildTool,
        };

        let message = TaskMessage {
            task_id,
            project_id: project.project_id,
            task_type,
            workflow_type: project.workflow_type,
            requirement: project.requirement.clone(),
            user_id: project.user_id.clone(),
            priority: project.priority,
            action,
            target_stage,
            execute_to_completion: true,
            metadata: project.metadata.clone(),
        };

        let now = Utc::now();
        let task = Task {
            task_id,
            task_type,
            project_id: project.project_id,
            status: TaskStatus::Pending,
            priority: project.priority,
            payload: serde_json::to_value(&message).map_err(nexus_db::DbError::from)?,
            result: None,
            error_message: None,
            retry_count: 0,
            worker_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        self.tasks.create(&task).await?;
        self.enqueue(&message).await?;
        self.tasks.set_status(task_id, TaskStatus::Queued).await?;
        Ok(task_id)
    }

    /// Enqueue a deployment task for a built project.
    pub async fn send_deploy_task(
        &self,
        project_id: ResourceId,
        agent_id: ResourceId,
    ) -> EngineResult<ResourceId> {
        let project = self.projects.get(project_id).await?;
        let task_id = ResourceId::new();
        let now = Utc::now();

        let mut metadata = project.metadata.clone();
        metadata.insert(
            "agent_id".to_string(),
            serde_json::Value::String(agent_id.to_string()),
        );

        let message = TaskMessage {
            task_id,
            project_id,
            task_type: TaskType::DeployAgent,
            workflow_type: project.workflow_type,
            requirement: project.requirement.clone(),
            user_id: project.user_id.clone(),
            priority: project.priority,
            action: TaskAction::Execute,
            target_stage: None,
            execute_to_completion: true,
            metadata,
        };

        let task = Task {
            task_id,
            task_type: TaskType::DeployAgent,
            project_id,
            status: TaskStatus::Pending,
            priority: project.priority,
            payload: serde_json::to_value(&message).map_err(nexus_db::DbError::from)?,
            result: None,
            error_message: None,
            retry_count: 0,
            worker_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        self.tasks.create(&task).await?;
        self.enqueue(&message).await?;
        self.tasks.set_status(task_id, TaskStatus::Queued).await?;
        Ok(task_id)
    }

    /// Derived status view over the project and its stages.
    pub async fn get_workflow_status(
        &self,
        project_id: ResourceId,
    ) -> EngineResult<WorkflowStatusView> {
        let project = self.projects.get(project_id).await?;
        let records = self.stages.list(project_id).await?;

        let completed_stages: Vec<String> = records
            .iter()
            .filter(|r| r.status == nexus_core::stage::StageStatus::Completed)
            .map(|r| r.stage_name.clone())
            .collect();
        let pending_stages: Vec<String> = records
            .iter()
            .filter(|r| r.status == nexus_core::stage::StageStatus::Pending)
            .map(|r| r.stage_name.clone())
            .collect();

        Ok(WorkflowStatusView {
            project_id,
            workflow_type: project.workflow_type,
            status: project.status,
            control_status: project.control_status,
            current_stage: project.current_stage,
            completed_stages,
            pending_stages,
            progress: project.progress,
            error_info: project.error_info,
            aggregated_metrics: project.aggregated_metrics,
            metadata: project.metadata,
        })
    }

    /// A stage's output with the blob reference resolved.
    pub async fn get_stage_output(
        &self,
        project_id: ResourceId,
        stage_name: &str,
    ) -> EngineResult<StageOutputView> {
        let stage = normalize_stage_name(stage_name)
            .ok_or_else(|| EngineError::UnknownStage(stage_name.to_string()))?;
        let record: StageRecord = self.stages.get(project_id, stage.as_str()).await?;
        let content = self
            .context_manager
            .resolve_stage_content(project_id, stage.as_str())
            .await?;
        Ok(StageOutputView {
            stage_name: record.stage_name,
            status: record.status,
            content,
            error_message: record.error_message,
        })
    }
}
