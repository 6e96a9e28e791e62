//! Workflow task handler.
//!
//! One handler per message: reconcile the task and project records,
//! detect mid-pipeline resumption, drive the engine, and translate
//! the execution result into terminal statuses. Handlers tolerate
//! duplicate delivery; the engine skips completed stages on its own.

use chrono::Utc;
use nexus_core::ResourceId;
use nexus_core::llm::LlmInvoker;
use nexus_core::project::{ControlStatus, ErrorInfo, ProjectStatus, WorkflowType};
use nexus_core::stage::{StageRecord, StageStatus};
use nexus_core::task::{TaskAction, TaskMessage, TaskStatus, TaskType};
use nexus_db::{ProjectRepo, ProjectUpdate, StageRepo, TaskRepo};
use nexus_deployer::{DeployOptions, DeploymentService};
use nexus_engine::{ContextManager, ExecutionResult, FileSyncManager, WorkflowEngine, WorkflowOutcome};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Terminal task/project statuses for an engine outcome.
fn translate_outcome(outcome: WorkflowOutcome) -> (TaskStatus, ProjectStatus) {
    match outcome {
        WorkflowOutcome::Completed => (TaskStatus::Completed, ProjectStatus::Completed),
        WorkflowOutcome::Failed => (TaskStatus::Failed, ProjectStatus::Failed),
        WorkflowOutcome::Paused => (TaskStatus::Pending, ProjectStatus::Paused),
        WorkflowOutcome::Stopped => (TaskStatus::Cancelled, ProjectStatus::Cancelled),
    }
}

/// A project with some stages completed and some not is a
/// mid-pipeline resumption; execution continues at the first
/// non-completed stage.
fn detect_resume_stage(records: &[StageRecord]) -> Option<String> {
    let any_completed = records.iter().any(|r| r.status == StageStatus::Completed);
    if !any_completed {
        return None;
    }
    records
        .iter()
        .find(|r| r.status != StageStatus::Completed)
        .map(|r| r.stage_name.clone())
}

/// Dispatches one queue message to the engine or the deployer.
pub struct WorkflowHandler {
    projects: Arc<dyn ProjectRepo>,
    stages: Arc<dyn StageRepo>,
    tasks: Arc<dyn TaskRepo>,
    context_manager: Arc<ContextManager>,
    invoker: Arc<dyn LlmInvoker>,
    file_sync: Arc<FileSyncManager>,
    deployment: Arc<DeploymentService>,
    worker_id: String,
}

impl WorkflowHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        projects: Arc<dyn ProjectRepo>,
        stages: Arc<dyn StageRepo>,
        tasks: Arc<dyn TaskRepo>,
        context_manager: Arc<ContextManager>,
        invoker: Arc<dyn LlmInvoker>,
        file_sync: Arc<FileSyncManager>,
        deployment: Arc<DeploymentService>,
        worker_id: String,
    ) -> Self {
        Self {
            projects,
            stages,
            tasks,
            context_manager,
            invoker,
            file_sync,
            deployment,
            worker_id,
        }
    }

    /// Handle one message. `true` acks the message; `false` leaves it
    /// for redelivery.
    pub async fn handle(&self, message: &TaskMessage) -> bool {
        info!(task_id = %message.task_id, project_id = %message.project_id,
              workflow = %message.workflow_type, task_type = %message.task_type,
              "processing task");

        match message.task_type {
            TaskType::DeployAgent => self.handle_deploy(message).await,
            _ => self.handle_workflow(message).await,
        }
    }

    async fn handle_workflow(&self, message: &TaskMessage) -> bool {
        // Per-workflow validation before any record mutates.
        match message.workflow_type {
            WorkflowType::AgentUpdate => {
                if !message.metadata.contains_key("agent_id") {
                    return self
                        .fail_task(message, "agent update task missing agent_id")
                        .await;
                }
            }
            WorkflowType::AgentBuild | WorkflowType::ToolBuild => {
                if message.requirement.trim().is_empty()
                    && message.action == TaskAction::Execute
                    && message.target_stage.is_none()
                {
                    return self
                        .fail_task(message, "requirement is required for a fresh execution")
                        .await;
                }
            }
        }

        if let Err(e) = self.tasks.mark_running(message.task_id, &self.worker_id).await {
            error!(task_id = %message.task_id, error = %e, "failed to mark task running");
            return false;
        }
        if let Err(e) = self
            .projects
            .update(
                message.project_id,
                ProjectUpdate {
                    status: Some(ProjectStatus::Building),
                    control_status: Some(ControlStatus::Running),
                    error_info: Some(None),
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
        {
            error!(project_id = %message.project_id, error = %e,
                   "failed to mark project building");
            return false;
        }

        let mut action = message.action;
        let mut target_stage = message.target_stage.clone();

        // A fresh delivery of a partially built project resumes from
        // the first non-completed stage regardless of what the
        // message says.
        match self.stages.list(message.project_id).await {
            Ok(records) => {
                if action == TaskAction::Execute {
                    if let Some(stage) = detect_resume_stage(&records) {
                        info!(project_id = %message.project_id, stage = %stage,
                              "detected checkpoint, resuming");
                        action = TaskAction::Resume;
                        target_stage = Some(stage);
                    }
                }
                self.ensure_project_files(message, &records).await;
            }
            Err(e) => warn!(project_id = %message.project_id, error = %e,
                            "failed to inspect stage records"),
        }

        let mut engine = WorkflowEngine::new(
            message.project_id,
            self.context_manager.clone(),
            self.invoker.clone(),
        )
        .with_file_sync(self.file_sync.clone());

        let state: HashMap<String, serde_json::Value> = message
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let result = match action {
            TaskAction::Resume => {
                if let Err(e) = engine.resume(target_stage.as_deref()).await {
                    return self.fail_task(message, &e.to_string()).await;
                }
                engine.execute_to_completion(state).await
            }
            TaskAction::Restart => {
                let Some(stage) = target_stage.as_deref() else {
                    return self
                        .fail_task(message, "restart requires a target stage")
                        .await;
                };
                engine
                    .execute_from_stage(stage, message.execute_to_completion, state)
                    .await
            }
            TaskAction::Execute => match target_stage.as_deref() {
                Some(stage) => {
                    engine
                        .execute_from_stage(stage, message.execute_to_completion, state)
                        .await
                }
                None => engine.execute_to_completion(state).await,
            },
        };

        match result {
            Ok(result) => self.record_result(message, result).await,
            Err(e) => self.fail_task(message, &e.to_string()).await,
        }
    }

    /// Pull the project from the blob store when files a completed
    /// stage generated are not on this worker's disk.
    async fn ensure_project_files(&self, message: &TaskMessage, records: &[StageRecord]) {
        let required: Vec<String> = records
            .iter()
            .filter(|r| r.status == StageStatus::Completed)
            .flat_map(|r| r.generated_files.iter().map(|f| f.path.clone()))
            .collect();
        if required.is_empty() {
            return;
        }

        let project_name = match self.projects.try_get(message.project_id).await {
            Ok(Some(project)) => project.project_name,
            _ => String::new(),
        };
        match self
            .file_sync
            .ensure_files_available(message.project_id, &project_name, &required)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(project_id = %message.project_id,
                               "some project files remain unavailable"),
            Err(e) => warn!(project_id = %message.project_id, error = %e,
                            "file availability check failed"),
        }
    }

    async fn record_result(&self, message: &TaskMessage, result: ExecutionResult) -> bool {
        let (task_status, project_status) = translate_outcome(result.final_status);
        let result_value = serde_json::to_value(&result).ok();

        match result.final_status {
            WorkflowOutcome::Completed => {
                let _ = self
                    .tasks
                    .finish(message.task_id, task_status, result_value, None)
                    .await;
                let _ = self
                    .projects
                    .update(
                        message.project_id,
                        ProjectUpdate {
                            status: Some(project_status),
                            progress: Some(100.0),
                            completed_at: Some(Some(Utc::now())),
                            ..Default::default()
                        },
                    )
                    .await;
                info!(task_id = %message.task_id, "task completed");
                true
            }
            WorkflowOutcome::Paused => {
                let _ = self
                    .tasks
                    .finish(message.task_id, task_status, result_value, None)
                    .await;
                let _ = self
                    .projects
                    .update(
                        message.project_id,
                        ProjectUpdate::status(project_status),
                    )
                    .await;
                info!(task_id = %message.task_id, "task paused");
                true
            }
            WorkflowOutcome::Stopped => {
                let _ = self
                    .tasks
                    .finish(message.task_id, task_status, result_value, None)
                    .await;
                let _ = self
                    .projects
                    .update(
                        message.project_id,
                        ProjectUpdate {
                            status: Some(project_status),
                            completed_at: Some(Some(Utc::now())),
                            ..Default::default()
                        },
                    )
                    .await;
                info!(task_id = %message.task_id, "task stopped by user");
                true
            }
            WorkflowOutcome::Failed => {
                let error_message = result
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string());
                let _ = self
                    .tasks
                    .finish(
                        message.task_id,
                        task_status,
                        result_value,
                        Some(error_message.clone()),
                    )
                    .await;
                let _ = self
                    .projects
                    .update(
                        message.project_id,
                        ProjectUpdate {
                            status: Some(project_status),
                            error_info: Some(Some(ErrorInfo {
                                message: error_message.clone(),
                                failed_stage: result.failed_stage.clone(),
                                ..Default::default()
                            })),
                            ..Default::default()
                        },
                    )
                    .await;
                error!(task_id = %message.task_id, error = %error_message, "task failed");
                false
            }
        }
    }

    async fn fail_task(&self, message: &TaskMessage, error_message: &str) -> bool {
        error!(task_id = %message.task_id, error = %error_message, "task failed");
        let _ = self
            .tasks
            .finish(
                message.task_id,
                TaskStatus::Failed,
                None,
                Some(error_message.to_string()),
            )
            .await;
        let _ = self
            .projects
            .update(
                message.project_id,
                ProjectUpdate {
                    status: Some(ProjectStatus::Failed),
                    error_info: Some(Some(ErrorInfo::new(error_message))),
                    ..Default::default()
                },
            )
            .await;
        false
    }

    async fn handle_deploy(&self, message: &TaskMessage) -> bool {
        if let Err(e) = self.tasks.mark_running(message.task_id, &self.worker_id).await {
            error!(task_id = %message.task_id, error = %e, "failed to mark task running");
            return false;
        }

        let agent_id = message
            .metadata
            .get("agent_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<ResourceId>().ok());

        let options = DeployOptions {
            dry_run: false,
            agent_id,
        };
        match self.deployment.deploy(message.project_id, options).await {
            Ok(outcome) => {
                let _ = self
                    .tasks
                    .finish(
                        message.task_id,
                        TaskStatus::Completed,
                        serde_json::to_value(&outcome).ok(),
                        None,
                    )
                    .await;
                info!(task_id = %message.task_id, agent_id = %outcome.agent_id,
                      "deployment task completed");
                true
            }
            Err(e) => {
                let _ = self
                    .tasks
                    .finish(
                        message.task_id,
                        TaskStatus::Failed,
                        None,
                        Some(e.to_string()),
                    )
                    .await;
                error!(task_id = %message.task_id, error = %e, "deployment task failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(stage_name: &str, stage_number: i32, status: StageStatus) -> StageRecord {
        StageRecord {
            project_id: ResourceId::new(),
            stage_name: stage_name.to_string(),
            stage_number,
            display_name: stage_name.to_string(),
            agent_name: None,
            status,
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
        }
    }

    #[test]
    fn outcome_translation_table() {
        assert_eq!(
            translate_outcome(WorkflowOutcome::Completed),
            (TaskStatus::Completed, ProjectStatus::Completed)
        );
        assert_eq!(
            translate_outcome(WorkflowOutcome::Failed),
            (TaskStatus::Failed, ProjectStatus::Failed)
        );
        assert_eq!(
            translate_outcome(WorkflowOutcome::Paused),
            (TaskStatus::Pending, ProjectStatus::Paused)
        );
        assert_eq!(
            translate_outcome(WorkflowOutcome::Stopped),
            (TaskStatus::Cancelled, ProjectStatus::Cancelled)
        );
    }

    #[test]
    fn resume_detection_needs_a_checkpoint() {
        // Nothing completed: fresh execution, no resume.
        let fresh = vec![
            record("a", 1, StageStatus::Pending),
            record("b", 2, StageStatus::Pending),
        ];
        assert_eq!(detect_resume_stage(&fresh), None);

        // Mid-pipeline: resume at the first non-completed stage,
        // including one left running by a crashed worker.
        let mid = vec![
            record("a", 1, StageStatus::Completed),
            record("b", 2, StageStatus::Running),
            record("c", 3, StageStatus::Pending),
        ];
        assert_eq!(detect_resume_stage(&mid).as_deref(), Some("b"));

        let failed = vec![
            record("a", 1, StageStatus::Completed),
            record("b", 2, StageStatus::Failed),
            record("c", 3, StageStatus::Pending),
        ];
        assert_eq!(detect_resume_stage(&failed).as_deref(), Some("b"));

        // Everything completed: nothing to resume.
        let done = vec![
            record("a", 1, StageStatus::Completed),
            record("b", 2, StageStatus::Completed),
        ];
        assert_eq!(detect_resume_stage(&done), None);
    }
}
