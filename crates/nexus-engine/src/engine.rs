//! Workflow engine.
//!
//! Sequences the configured stages for one project, validates
//! prerequisites, honors pause/stop control signals at stage
//! boundaries, and leaves the records and context consistent on every
//! exit path. Control flow is a value threaded through the loop, not
//! an exception.

use nexus_core::ResourceId;
use nexus_core::context::WorkflowContext;
use nexus_core::llm::LlmInvoker;
use nexus_core::project::ControlStatus;
use nexus_core::stage::{StageOutput, StageStatus};
use nexus_config::{StageName, normalize_stage_name};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::context::ContextManager;
use crate::executor::StageExecutor;
use crate::file_sync::FileSyncManager;
use crate::{EngineError, EngineResult};

/// Terminal outcome of an engine run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowOutcome {
    Completed,
    Paused,
    Stopped,
    Failed,
}

/// What one engine entry point produced, atomic per call.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub completed_stages: Vec<String>,
    pub failed_stage: Option<String>,
    pub error_message: Option<String>,
    pub final_status: WorkflowOutcome,
    pub missing_prerequisites: Vec<String>,
}

impl ExecutionResult {
    fn new(final_status: WorkflowOutcome) -> Self {
        Self {
            success: final_status == WorkflowOutcome::Completed,
            completed_stages: Vec::new(),
            failed_stage: None,
            error_message: None,
            final_status,
            missing_prerequisites: Vec::new(),
        }
    }
}

/// Point-in-time view of a workflow, for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStatus {
    pub project_id: ResourceId,
    pub status: StageStatus,
    pub control_status: ControlStatus,
    pub current_stage: Option<String>,
    pub completed_stages: Vec<String>,
    pub pending_stages: Vec<String>,
    pub aggregated_metrics: nexus_core::project::AggregatedMetrics,
}

/// Cooperative control signal observed between stages and around the
/// LLM invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlSignal {
    Pause,
    Stop,
}

enum StageRun {
    /// The stage ran; a signal observed after the invocation is
    /// carried alongside the persisted output.
    Ran(StageOutput, Option<ControlSignal>),
    /// A signal arrived before the invocation started.
    Interrupted(ControlSignal),
}

/// Public orchestrator for one project's pipeline.
pub struct WorkflowEngine {
    project_id: ResourceId,
    context_manager: Arc<ContextManager>,
    executor: StageExecutor,
    file_sync: Option<Arc<FileSyncManager>>,
    context: Option<WorkflowContext>,
}

impl WorkflowEngine {
    pub fn new(
        project_id: ResourceId,
        context_manager: Arc<ContextManager>,
        invoker: Arc<dyn LlmInvoker>,
    ) -> Self {
        let executor = StageExecutor::new(invoker, context_manager.clone());
        Self {
            project_id,
            context_manager,
            executor,
            file_sync: None,
            context: None,
        }
    }

    /// Push generated files to the blob store after each completed
    /// stage so any worker can resume this project.
    pub fn with_file_sync(mut self, file_sync: Arc<FileSyncManager>) -> Self {
        self.file_sync = Some(file_sync);
        self
    }

    pub fn project_id(&self) -> ResourceId {
        self.project_id
    }

    async fn context_mut(&mut self) -> EngineResult<&mut WorkflowContext> {
        if self.context.is_none() {
            let context = self.context_manager.load_from_db(self.project_id).await?;
            self.context = Some(context);
        }
        Ok(self.context.as_mut().unwrap())
    }

    /// Resolve and validate a caller-supplied stage name.
    fn resolve_stage(&self, stage_name: &str) -> EngineResult<StageName> {
        normalize_stage_name(stage_name)
            .ok_or_else(|| EngineError::UnknownStage(stage_name.to_string()))
    }

    /// All prerequisites of `stage` must be completed before it may
    /// start.
    pub async fn validate_prerequisites(&mut self, stage_name: &str) -> EngineResult<()> {
        let stage = self.resolve_stage(stage_name)?;
        let context = self.context_mut().await?;
        let completed: std::collections::HashSet<String> =
            context.completed_stages().into_iter().collect();
        let missing: Vec<String> = context
            .prerequisite_stages(stage.as_str())
            .into_iter()
            .filter(|p| !completed.contains(p))
            .collect();
        if !missing.is_empty() {
            warn!(stage = %stage, ?missing, "prerequisites not met");
            return Err(EngineError::Prerequisite {
                stage: stage.as_str().to_string(),
                missing,
            });
        }
        Ok(())
    }

    /// Re-read the control status from the record store. Pause/stop
    /// requests arrive on a separate path and must never be missed at
    /// a stage boundary.
    async fn refresh_control_status(&mut self) -> EngineResult<Option<ControlSignal>> {
        let projects = self.context_manager.projects().clone();
        let context = self.context_mut().await?;
        match projects.try_get(context.project_id).await {
            Ok(Some(project)) => {
                context.control_status = project.control_status;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to refresh control status"),
        }
        Ok(match context.control_status {
            ControlStatus::Stopped | ControlStatus::Cancelled => Some(ControlSignal::Stop),
            ControlStatus::Paused => Some(ControlSignal::Pause),
            ControlStatus::Running => None,
        })
    }

    /// Execute exactly one stage, with prerequisite check.
    pub async fn execute_single_stage(
        &mut self,
        stage_name: &str,
        input_override: Option<String>,
        state: HashMap<String, serde_json::Value>,
    ) -> EngineResult<StageOutput> {
        let stage = self.resolve_stage(stage_name)?;
        self.validate_prerequisites(stage_name).await?;

        match self.run_stage(stage, input_override, state).await? {
            StageRun::Ran(output, _) => Ok(output),
            StageRun::Interrupted(signal) => Err(EngineError::InvalidTransition(format!(
                "workflow is {} before stage {}",
                match signal {
                    ControlSignal::Pause => "paused",
                    ControlSignal::Stop => "stopped",
                },
                stage
            ))),
        }
    }

    /// Run one stage through the executor, persisting on every path.
    async fn run_stage(
        &mut self,
        stage: StageName,
        input_override: Option<String>,
        state: HashMap<String, serde_json::Value>,
    ) -> EngineResult<StageRun> {
        {
            let context = self.context_mut().await?;
            context.current_stage = Some(stage.as_str().to_string());
            context.status = StageStatus::Running;
        }
        self.save_context().await?;

        // A pause/stop may have landed while the running mark was
        // persisted; observe it before paying for the invocation.
        if let Some(signal) = self.refresh_control_status().await? {
            return Ok(StageRun::Interrupted(signal));
        }

        let context_snapshot = self.context_mut().await?.clone();
        let output = self
            .executor
            .execute_stage(&context_snapshot, stage, input_override, state)
            .await?;

        // Observed immediately after the invocation: the output is
        // persisted either way so no progress is lost.
        let signal = self.refresh_control_status().await?;

        {
            let context = self.context_mut().await?;
            context.update_stage_output(output.clone());
            if output.is_failed() {
                context.status = StageStatus::Failed;
            }
        }
        self.save_context().await?;

        if output.is_completed() {
            self.push_files(&output).await;
        }

        Ok(StageRun::Ran(output, signal))
    }

    async fn push_files(&mut self, output: &StageOutput) {
        let Some(file_sync) = self.file_sync.clone() else {
            return;
        };
        let Some(context) = self.context.as_ref() else {
            return;
        };
        if output.generated_files.is_empty() {
            return;
        }
        if let Err(e) = file_sync
            .sync_to_blob(
                context.project_id,
                &context.project_name,
                Some(&output.generated_files),
            )
            .await
        {
            warn!(stage = %output.stage_name, error = %e, "file push failed");
        }
    }

    /// Execute from `stage_name` onward (or just that stage when
    /// `to_completion` is false).
    pub async fn execute_from_stage(
        &mut self,
        stage_name: &str,
        to_completion: bool,
        state: HashMap<String, serde_json::Value>,
    ) -> EngineResult<ExecutionResult> {
        let stage = match self.resolve_stage(stage_name) {
            Ok(stage) => stage,
            Err(EngineError::UnknownStage(name)) => {
                let mut result = ExecutionResult::new(WorkflowOutcome::Failed);
                result.error_message = Some(format!("unknown stage: {name}"));
                return Ok(result);
            }
            Err(e) => return Err(e),
        };

        match self.validate_prerequisites(stage_name).await {
            Ok(()) => {}
            Err(EngineError::Prerequisite { stage, missing }) => {
                let mut result = ExecutionResult::new(WorkflowOutcome::Failed);
                result.error_message = Some(format!(
                    "prerequisites not met for stage {stage}: missing {missing:?}"
                ));
                result.missing_prerequisites = missing;
                return Ok(result);
            }
            Err(e) => return Err(e),
        }

        match self.refresh_control_status().await? {
            Some(ControlSignal::Stop) => {
                let mut result = ExecutionResult::new(WorkflowOutcome::Stopped);
                result.error_message = Some("Workflow stopped by user".to_string());
                return Ok(result);
            }
            Some(ControlSignal::Pause) => {
                return Ok(ExecutionResult::new(WorkflowOutcome::Paused));
            }
            None => {}
        }

        let to_execute: Vec<String> = if to_completion {
            let pending = self.context_mut().await?.pending_stages();
            match pending.iter().position(|s| s == stage.as_str()) {
                Some(index) => pending[index..].to_vec(),
                None => vec![stage.as_str().to_string()],
            }
        } else {
            vec![stage.as_str().to_string()]
        };

        info!(project_id = %self.project_id, stages = ?to_execute, "executing stages");
        let mut result = ExecutionResult::new(WorkflowOutcome::Completed);

        for stage_name in to_execute {
            let stage = self.resolve_stage(&stage_name)?;

            match self.refresh_control_status().await? {
                Some(ControlSignal::Stop) => {
                    result.final_status = WorkflowOutcome::Stopped;
                    result.success = false;
                    result.error_message = Some("Workflow stopped by user".to_string());
                    return Ok(result);
                }
                Some(ControlSignal::Pause) => {
                    result.final_status = WorkflowOutcome::Paused;
                    result.success = false;
                    return Ok(result);
                }
                None => {}
            }

            match self.run_stage(stage, None, state.clone()).await? {
                StageRun::Interrupted(ControlSignal::Stop) => {
                    result.final_status = WorkflowOutcome::Stopped;
                    result.success = false;
                    result.error_message = Some("Workflow stopped by user".to_string());
                    return Ok(result);
                }
                StageRun::Interrupted(ControlSignal::Pause) => {
                    result.final_status = WorkflowOutcome::Paused;
                    result.success = false;
                    return Ok(result);
                }
                StageRun::Ran(output, signal) => {
                    if output.is_failed() {
                        error!(stage = %stage, error = ?output.error_message, "stage failed");
                        result.final_status = WorkflowOutcome::Failed;
                        result.success = false;
                        result.failed_stage = Some(stage.as_str().to_string());
                        result.error_message = output.error_message.clone();
                        self.mark_project_failed(stage, output.error_message.as_deref())
                            .await?;
                        return Ok(result);
                    }
                    result.completed_stages.push(stage.as_str().to_string());

                    match signal {
                        Some(ControlSignal::Stop) => {
                            info!(stage = %stage, "workflow stopped after stage");
                            result.final_status = WorkflowOutcome::Stopped;
                            result.success = false;
                            result.error_message = Some("Workflow stopped by user".to_string());
                            return Ok(result);
                        }
                        Some(ControlSignal::Pause) => {
                            info!(stage = %stage, "workflow paused after stage");
                            result.final_status = WorkflowOutcome::Paused;
                            result.success = false;
                            return Ok(result);
                        }
                        None => {}
                    }
                }
            }
        }

        // Finalize only when the whole pipeline is exhausted. A
        // single-stage run reports just the stage it ran and leaves
        // the project status derived from the stage records.
        let exhausted = self.context_mut().await?.next_stage().is_none();
        if to_completion && exhausted {
            {
                let context = self.context_mut().await?;
                context.status = StageStatus::Completed;
                result.completed_stages = context.completed_stages();
            }
            self.save_context().await?;
            info!(project_id = %self.project_id, "workflow completed");
        } else {
            info!(project_id = %self.project_id, stages = ?result.completed_stages,
                  "requested stages completed");
        }
        Ok(result)
    }

    /// Execute from the next pending stage to completion.
    pub async fn execute_to_completion(
        &mut self,
        state: HashMap<String, serde_json::Value>,
    ) -> EngineResult<ExecutionResult> {
        let next = self.context_mut().await?.next_stage();
        match next {
            Some(stage) => self.execute_from_stage(&stage, true, state).await,
            None => {
                // Nothing pending; make the completed status durable.
                let context = self.context_mut().await?;
                context.status = StageStatus::Completed;
                let completed = context.completed_stages();
                self.save_context().await?;
                let mut result = ExecutionResult::new(WorkflowOutcome::Completed);
                result.completed_stages = completed;
                Ok(result)
            }
        }
    }

    /// Request a pause: the run yields after the current stage.
    pub async fn pause(&mut self) -> EngineResult<()> {
        info!(project_id = %self.project_id, "pause requested");
        let context = self.context_mut().await?;
        context.control_status = ControlStatus::Paused;
        context.pause_requested_at = Some(chrono::Utc::now());
        self.save_context().await
    }

    /// Clear pause/stop state and optionally pin the resume stage.
    pub async fn resume(&mut self, from_stage: Option<&str>) -> EngineResult<()> {
        info!(project_id = %self.project_id, ?from_stage, "resume requested");
        let from_stage = from_stage
            .map(|s| self.resolve_stage(s))
            .transpose()?
            .map(|s| s.as_str().to_string());
        let context = self.context_mut().await?;
        context.control_status = ControlStatus::Running;
        context.pause_requested_at = None;
        context.stop_requested_at = None;
        if from_stage.is_some() {
            context.resume_from_stage = from_stage;
        }
        self.save_context().await
    }

    /// Request a stop: the run exits after the current stage and the
    /// project lands cancelled.
    pub async fn stop(&mut self) -> EngineResult<()> {
        info!(project_id = %self.project_id, "stop requested");
        let context = self.context_mut().await?;
        context.control_status = ControlStatus::Stopped;
        context.stop_requested_at = Some(chrono::Utc::now());
        self.save_context().await
    }

    pub async fn get_status(&mut self) -> EngineResult<WorkflowStatus> {
        let context = self.context_mut().await?;
        Ok(WorkflowStatus {
            project_id: context.project_id,
            status: context.status,
            control_status: context.control_status,
            current_stage: context.current_stage.clone(),
            completed_stages: context.completed_stages(),
            pending_stages: context.pending_stages(),
            aggregated_metrics: context.aggregated_metrics.clone(),
        })
    }

    /// Attach the failure details to the project record. The failed
    /// stage output itself was already persisted by `run_stage`.
    async fn mark_project_failed(
        &mut self,
        stage: StageName,
        message: Option<&str>,
    ) -> EngineResult<()> {
        let error_info = nexus_core::project::ErrorInfo {
            message: message.unwrap_or("stage execution failed").to_string(),
            failed_stage: Some(stage.as_str().to_string()),
            ..Default::default()
        };
        self.context_manager
            .projects()
            .update(
                self.project_id,
                nexus_db::ProjectUpdate {
                    error_info: Some(Some(error_info)),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn save_context(&mut self) -> EngineResult<()> {
        let context_manager = self.context_manager.clone();
        let Some(context) = self.context.as_mut() else {
            return Ok(());
        };
        if let Err(e) = context_manager.save_to_db(context).await {
            error!(project_id = %context.project_id, error = %e, "failed to save context");
            return Err(e);
        }
        Ok(())
    }
}
