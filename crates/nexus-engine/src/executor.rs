//! Stage executor.
//!
//! Runs one stage against the LLM invoker: builds the input context,
//! measures the invocation, scans the project directory for generated
//! files and extracts the stage's design document. The executor never
//! touches the record store; the engine persists what it returns.

use chrono::{DateTime, Utc};
use nexus_core::context::WorkflowContext;
use nexus_core::llm::{LlmInvoker, LlmRequest};
use nexus_core::stage::{
    DesignDocument, DocumentFormat, FileMetadata, StageMetrics, StageOutput, StageStatus,
};
use nexus_config::{StageName, workflow_catalog};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::context::ContextManager;
use crate::multi_agent::{self, MultiAgentIterator};
use crate::{EngineError, EngineResult};

/// Executes single stages and delegates iterative ones to the
/// multi-agent fan-out.
pub struct StageExecutor {
    invoker: Arc<dyn LlmInvoker>,
    context_manager: Arc<ContextManager>,
}

impl StageExecutor {
    pub fn new(invoker: Arc<dyn LlmInvoker>, context_manager: Arc<ContextManager>) -> Self {
        Self {
            invoker,
            context_manager,
        }
    }

    /// Run one stage to a fully populated output.
    ///
    /// A failed LLM invocation returns a `failed` output rather than
    /// an error; errors are reserved for non-recoverable setup
    /// problems such as a stage missing from the catalog.
    pub async fn execute_stage(
        &self,
        context: &WorkflowContext,
        stage: StageName,
        input_override: Option<String>,
        state: HashMap<String, serde_json::Value>,
    ) -> EngineResult<StageOutput> {
        let catalog = workflow_catalog(context.workflow_type);
        let spec = catalog
            .stage(stage)
            .ok_or_else(|| EngineError::UnknownStage(stage.as_str().to_string()))?;

        if spec.iterative {
            let iterator = MultiAgentIterator::from_context(context);
            if iterator.is_multi_agent() {
                info!(stage = %stage, agents = iterator.agent_count(),
                      "iterative stage fanning out per subagent");
                let base_context = match input_override {
                    Some(input) => input,
                    None => self.context_manager.format_stage_context(context, stage).await,
                };
                return multi_agent::execute_iterative_stage(
                    self, context, iterator, stage, base_context, state,
                )
                .await;
            }
        }

        self.execute_single_agent(context, stage, input_override, state)
            .await
    }

    /// The single-agent path: one LLM invocation for the stage.
    pub(crate) async fn execute_single_agent(
        &self,
        context: &WorkflowContext,
        stage: StageName,
        input_override: Option<String>,
        mut state: HashMap<String, serde_json::Value>,
    ) -> EngineResult<StageOutput> {
        let catalog = workflow_catalog(context.workflow_type);
        let spec = catalog
            .stage(stage)
            .ok_or_else(|| EngineError::UnknownStage(stage.as_str().to_string()))?;

        let input = match input_override {
            Some(input) => input,
            None => self.context_manager.format_stage_context(context, stage).await,
        };

        state.insert(
            "project_id".to_string(),
            serde_json::Value::String(context.project_id.to_string()),
        );
        state.insert(
            "project_name".to_string(),
            serde_json::Value::String(context.project_name.clone()),
        );

        let request = LlmRequest {
            template: spec.prompt_template.to_string(),
            context: input,
            state,
        };

        info!(stage = %stage, template = %spec.prompt_template, "invoking agent");
        let start = Instant::now();
        let response = match self.invoker.invoke(request).await {
            Ok(response) => response,
            Err(e) => {
                let elapsed = start.elapsed().as_secs_f64();
                warn!(stage = %stage, error = %e, "stage invocation failed");
                return Ok(StageOutput {
                    stage_name: stage.as_str().to_string(),
                    metrics: StageMetrics {
                        execution_time_seconds: elapsed,
                        ..Default::default()
                    },
                    completed_at: Some(Utc::now()),
                    status: StageStatus::Failed,
                    error_message: Some(e.to_string()),
                    ..Default::default()
                });
            }
        };
        let execution_time = start.elapsed().as_secs_f64();

        let metrics = StageMetrics {
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
            execution_time_seconds: execution_time,
            tool_calls_count: response.tool_calls.len() as u64,
            model_id: response.model_id,
        };

        let generated_files = self.scan_generated_files(context);
        let document = extract_design_document(stage, &response.text);
        let doc_path = self.write_design_document(context, stage, document.as_ref());

        info!(stage = %stage,
              tokens = metrics.total_tokens(),
              files = generated_files.len(),
              "stage completed");

        Ok(StageOutput {
            stage_name: stage.as_str().to_string(),
            content: response.text,
            blob_content_ref: None,
            metrics,
            generated_files,
            document,
            doc_path,
            completed_at: Some(Utc::now()),
            status: StageStatus::Completed,
            error_message: None,
        })
    }

    /// Write the design document into the project's `docs/` directory
    /// and return its project-relative path.
    fn write_design_document(
        &self,
        context: &WorkflowContext,
        stage: StageName,
        document: Option<&DesignDocument>,
    ) -> Option<String> {
        let document = document.filter(|d| !d.content.is_empty())?;
        let project_dir = self.project_dir(context)?;
        let extension = match document.format {
            DocumentFormat::Json => "json",
            DocumentFormat::Markdown => "md",
        };
        let relative = format!("docs/{}.{}", stage.as_str(), extension);
        let path = project_dir.join(&relative);
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(path = %path.display(), error = %e, "failed to create docs dir");
                return None;
            }
        }
        match std::fs::write(&path, &document.content) {
            Ok(()) => Some(relative),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to write design document");
                None
            }
        }
    }

    /// Walk the project directory for files the invocation produced.
    /// Dotfiles and anything under a hidden directory are skipped.
    fn scan_generated_files(&self, context: &WorkflowContext) -> Vec<FileMetadata> {
        let Some(project_dir) = self.project_dir(context) else {
            return Vec::new();
        };
        scan_directory(&project_dir)
    }

    fn project_dir(&self, context: &WorkflowContext) -> Option<PathBuf> {
        let settings = self.context_manager.settings();
        let by_name = settings.projects_dir.join(&context.project_name);
        if !context.project_name.is_empty() && by_name.is_dir() {
            return Some(by_name);
        }
        let by_id = settings.projects_dir.join(context.project_id.to_string());
        by_id.is_dir().then_some(by_id)
    }
}

/// Collect metadata for every visible file under `dir`.
pub(crate) fn scan_directory(dir: &Path) -> Vec<FileMetadata> {
    let mut files = Vec::new();
    // The root itself is exempt from the dotfile rule; only entries
    // inside the project are filtered.
    let walker = WalkDir::new(dir).into_iter().filter_entry(|entry| {
        entry.depth() == 0
            || !entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with('.'))
                .unwrap_or(false)
    });

    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let relative = match path.strip_prefix(dir) {
            Ok(relative) => relative.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };
        let checksum = std::fs::read(path)
            .ok()
            .map(|bytes| hex::encode(md5::compute(&bytes).0));
        let last_modified: Option<DateTime<Utc>> =
            metadata.modified().ok().map(DateTime::from);
        files.push(FileMetadata {
            path: relative,
            size: metadata.len(),
            checksum,
            last_modified,
        });
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    files
}

/// Extract the stage's design document by stage policy.
fn extract_design_document(stage: StageName, output: &str) -> Option<DesignDocument> {
    match stage {
        StageName::SystemArchitecture => {
            if let Some(json) = multi_agent::extract_json_block(output) {
                return Some(DesignDocument {
                    content: json,
                    format: DocumentFormat::Json,
                });
            }
            Some(DesignDocument {
                content: output.to_string(),
                format: DocumentFormat::Markdown,
            })
        }
        _ => Some(DesignDocument {
            content: output.to_string(),
            format: DocumentFormat::Markdown,
        }),
    }
}
