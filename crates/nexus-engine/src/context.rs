//! Workflow context management.
//!
//! Loads and saves the workflow context against the record store and
//! assembles the per-stage LLM input under a token budget.

use chrono::Utc;
use nexus_core::ResourceId;
use nexus_core::blob::BlobStore;
use nexus_core::context::{IntentAnalysis, WorkflowContext};
use nexus_core::project::{ControlStatus, ProjectStatus};
use nexus_core::stage::{StageOutput, StageStatus};
use nexus_db::{ProjectRepo, ProjectUpdate, StageRepo, StageUpdate};
use nexus_config::{Settings, StageName, normalize_stage_name, workflow_catalog};
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::EngineResult;

/// Rough mixed-text estimate: four characters per token.
pub const CHARS_PER_TOKEN: usize = 4;

/// Documents pulled into the context from the project directory.
const LOCAL_DOC_FILES: [&str; 4] = [
    "requirements.md",
    "architecture.md",
    "design.md",
    "config.yaml",
];

/// Minimum spare budget before local documents are worth adding.
const LOCAL_DOCS_MIN_TOKENS: usize = 1000;

/// Estimate the token count of a text.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / CHARS_PER_TOKEN
}

/// Truncate text to a token budget, marking the cut.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    let max_chars = max_tokens * CHARS_PER_TOKEN;
    if text.len() <= max_chars {
        return text.to_string();
    }
    let cut = max_chars.saturating_sub(50);
    let mut end = cut;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n\n... [content truncated] ...", &text[..end])
}

/// Summarize an over-budget stage output: keep markdown headings and
/// the first ten lines of each fenced code block, then hard-truncate.
pub fn summarize_stage_output(content: &str, max_tokens: usize) -> String {
    if estimate_tokens(content) <= max_tokens {
        return content.to_string();
    }

    let mut parts: Vec<&str> = Vec::new();
    for line in content.lines() {
        if line.starts_with('#') {
            parts.push(line);
        }
    }

    let mut in_code_block = false;
    let mut code_block_lines = 0;
    for line in content.lines() {
        if line.starts_with("```") {
            in_code_block = !in_code_block;
            if in_code_block {
                parts.push(line);
                code_block_lines = 0;
            } else {
                parts.push("```");
            }
        } else if in_code_block && code_block_lines < 10 {
            parts.push(line);
            code_block_lines += 1;
        }
    }

    let mut summary = parts.join("\n");
    if estimate_tokens(&summary) > max_tokens {
        summary = truncate_to_tokens(&summary, max_tokens);
    }
    format!("[summary]\n{summary}")
}

/// Loads, saves and formats workflow contexts.
pub struct ContextManager {
    projects: Arc<dyn ProjectRepo>,
    stages: Arc<dyn StageRepo>,
    blob: Arc<dyn BlobStore>,
    settings: Settings,
    rules_cache: OnceCell<String>,
}

impl ContextManager {
    pub fn new(
        projects: Arc<dyn ProjectRepo>,
        stages: Arc<dyn StageRepo>,
        blob: Arc<dyn BlobStore>,
        settings: Settings,
    ) -> Self {
        Self {
            projects,
            stages,
            blob,
            settings,
            rules_cache: OnceCell::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn projects(&self) -> &Arc<dyn ProjectRepo> {
        &self.projects
    }

    pub fn stages(&self) -> &Arc<dyn StageRepo> {
        &self.stages
    }

    pub fn blob(&self) -> &Arc<dyn BlobStore> {
        &self.blob
    }

    /// Blob key for an offloaded stage output.
    pub fn output_blob_key(&self, project_id: ResourceId, stage_name: &str) -> String {
        format!(
            "{}{}/outputs/{}.txt",
            self.settings.blob_prefix, project_id, stage_name
        )
    }

    /// Reconstruct the workflow context from project + stage records.
    ///
    /// Offloaded stage outputs are dereferenced from the blob store so
    /// downstream readers always see the full content.
    pub async fn load_from_db(&self, project_id: ResourceId) -> EngineResult<WorkflowContext> {
        let project = self.projects.get(project_id).await?;
        let records = self.stages.list(project_id).await?;

        let catalog = workflow_catalog(project.workflow_type);
        let mut context =
            WorkflowContext::new(project_id, project.workflow_type, catalog.stage_names());

        let mut stage_outputs = HashMap::new();
        for record in records {
            let mut content = record.agent_output_content.clone().unwrap_or_default();
            if content.is_empty() {
                if let Some(blob_ref) = &record.agent_output_blob_ref {
                    match self.blob.get(blob_ref).await {
                        Ok(bytes) => content = String::from_utf8_lossy(&bytes).into_owned(),
                        Err(e) => {
                            warn!(stage = %record.stage_name, error = %e,
                                  "failed to resolve offloaded stage output");
                        }
                    }
                }
            }

            let output = StageOutput {
                stage_name: record.stage_name.clone(),
                content,
                blob_content_ref: record.agent_output_blob_ref.clone(),
                metrics: record.metrics.clone().unwrap_or_default(),
                generated_files: record.generated_files.clone(),
                document: record.design_document.clone(),
                doc_path: record.doc_path.clone(),
                completed_at: record.completed_at,
                status: record.status,
                error_message: record.error_message.clone(),
            };
            stage_outputs.insert(record.stage_name, output);
        }

        // Intent analysis lives inside the completed orchestrator output.
        let intent = stage_outputs
            .get(StageName::Orchestrator.as_str())
            .filter(|o| o.is_completed())
            .map(|o| parse_intent(&o.content));

        // Aggregated metrics are recomputed from the completed stages
        // rather than trusted from the project record; a restart that
        // cleared stages must zero their contribution.
        let mut aggregated_metrics = nexus_core::project::AggregatedMetrics::default();
        for output in stage_outputs.values() {
            if output.is_completed() {
                aggregated_metrics.add_stage_metrics(&output.metrics);
            }
        }

        context.project_name = project.project_name;
        context.requirement = project.requirement;
        context.intent = intent;
        context.stage_outputs = stage_outputs;
        context.rules = self.load_rules().await;
        context.current_stage = project.current_stage;
        context.status = project_to_stage_status(project.status);
        context.control_status = project.control_status;
        context.aggregated_metrics = aggregated_metrics;
        context.pause_requested_at = project.pause_requested_at;
        context.stop_requested_at = project.stop_requested_at;
        context.resume_from_stage = project.resume_from_stage;
        context.created_at = Some(project.created_at);
        context.updated_at = Some(project.updated_at);

        info!(project_id = %project_id,
              completed = ?context.completed_stages(),
              "workflow context loaded");
        Ok(context)
    }

    /// Persist the context back to the record store.
    ///
    /// The stored control status wins over the in-memory one so a user
    /// pause/stop request issued mid-stage is never overwritten.
    pub async fn save_to_db(&self, context: &mut WorkflowContext) -> EngineResult<()> {
        if let Ok(Some(project)) = self.projects.try_get(context.project_id).await {
            if matches!(
                project.control_status,
                ControlStatus::Paused | ControlStatus::Stopped
            ) {
                context.control_status = project.control_status;
            }
        }

        let project_status = derive_project_status(context);

        self.projects
            .update(
                context.project_id,
                ProjectUpdate {
                    project_name: Some(context.project_name.clone()),
                    status: Some(project_status),
                    control_status: Some(context.control_status),
                    current_stage: Some(context.current_stage.clone()),
                    progress: Some(context.progress()),
                    aggregated_metrics: Some(context.aggregated_metrics.clone()),
                    pause_requested_at: context.pause_requested_at.map(Some),
                    stop_requested_at: context.stop_requested_at.map(Some),
                    resume_from_stage: context.resume_from_stage.clone().map(Some),
                    ..Default::default()
                },
            )
            .await?;

        // Flip the in-flight stage to running; legacy spellings are
        // normalized on the way through.
        if context.status == StageStatus::Running {
            if let Some(current) = context.current_stage.clone() {
                let has_output = context
                    .stage_outputs
                    .get(&current)
                    .map(|o| o.is_completed() || o.is_failed())
                    .unwrap_or(false);
                if !has_output {
                    if let Some(stage) = normalize_stage_name(&current) {
                        self.stages
                            .update(
                                context.project_id,
                                stage.as_str(),
                                StageUpdate {
                                    status: Some(StageStatus::Running),
                                    started_at: Some(Some(Utc::now())),
                                    ..Default::default()
                                },
                            )
                            .await?;
                    } else {
                        warn!(stage = %current, "unknown current stage, not marked running");
                    }
                }
            }
        }

        let stage_names: Vec<String> = context.stage_outputs.keys().cloned().collect();
        for stage_name in stage_names {
            let output = context.stage_outputs[&stage_name].clone();
            let persisted = self.persist_stage_output(context.project_id, output).await?;
            // Keep the assigned blob ref so later saves skip re-upload.
            context.stage_outputs.insert(stage_name, persisted);
        }
        Ok(())
    }

    /// Write one stage output to its record, offloading oversize
    /// content to the blob store. Returns the output with any blob
    /// reference assigned (the in-memory content stays intact).
    pub async fn persist_stage_output(
        &self,
        project_id: ResourceId,
        mut output: StageOutput,
    ) -> EngineResult<StageOutput> {
        if output.content_exceeds_limit() && output.blob_content_ref.is_none() {
            let key = self.output_blob_key(project_id, &output.stage_name);
            let bytes = output.content.clone().into_bytes();
            let checksum = hex::encode(md5::compute(&bytes).0);
            self.blob
                .put(&key, bytes, Some(checksum), Some(project_id.to_string()))
                .await?;
            info!(stage = %output.stage_name, key = %key, "stage output offloaded to blob store");
            output.blob_content_ref = Some(key);
        }

        let inline = if output.blob_content_ref.is_some() {
            String::new()
        } else {
            output.content.clone()
        };

        let duration = (output.metrics.execution_time_seconds > 0.0)
            .then_some(output.metrics.execution_time_seconds);

        self.stages
            .update(
                project_id,
                &output.stage_name,
                StageUpdate {
                    status: Some(output.status),
                    completed_at: Some(output.completed_at),
                    duration_seconds: Some(duration),
                    metrics: Some(Some(output.metrics.clone())),
                    agent_output_content: Some(Some(inline)),
                    agent_output_blob_ref: Some(output.blob_content_ref.clone()),
                    design_document: Some(output.document.clone()),
                    generated_files: Some(output.generated_files.clone()),
                    error_message: Some(output.error_message.clone()),
                    doc_path: Some(output.doc_path.clone()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(output)
    }

    /// Read a stage's output content, dereferencing the blob store
    /// when the inline field was emptied by offloading.
    pub async fn resolve_stage_content(
        &self,
        project_id: ResourceId,
        stage_name: &str,
    ) -> EngineResult<String> {
        let record = self.stages.get(project_id, stage_name).await?;
        if let Some(content) = record.agent_output_content.filter(|c| !c.is_empty()) {
            return Ok(content);
        }
        if let Some(blob_ref) = record.agent_output_blob_ref {
            let bytes = self.blob.get(&blob_ref).await?;
            return Ok(String::from_utf8_lossy(&bytes).into_owned());
        }
        Ok(String::new())
    }

    /// Assemble the LLM input for a stage under the token budget.
    ///
    /// Only completed prerequisites of `stage` are included. Remaining
    /// budget after the header block is split equally among them; any
    /// prerequisite over its share is summarized. Leftover budget goes
    /// to local documents, and a final truncation clips to the budget.
    pub async fn format_stage_context(
        &self,
        context: &WorkflowContext,
        stage: StageName,
    ) -> String {
        let max_tokens = self.settings.max_context_tokens;
        let catalog = workflow_catalog(context.workflow_type);

        let mut base_parts: Vec<String> = Vec::new();
        if !context.rules.is_empty() {
            base_parts.push(format!(
                "# Build Workflow Kickoff\n## Workflow rules:\n{}\n",
                context.rules
            ));
        }
        if !context.project_name.is_empty() {
            base_parts.push(format!(
                "## Project name constraint\n\
                 The project name is `{}`. Use this exact name when initializing \
                 the project; do not generate or modify it.\n",
                context.project_name
            ));
        }
        if let Some(intent) = &context.intent {
            if let Ok(json) = serde_json::to_string_pretty(intent) {
                base_parts.push(format!("## Intent analysis\n{json}\n"));
            }
        }
        base_parts.push(format!(
            "## Original user requirement\n{}\n",
            context.requirement
        ));
        base_parts.push("Complete the build steps in order, following the rules above.".to_string());

        let base_context = base_parts.join("\n");
        let mut current = base_context.clone();

        let completed = context.completed_stages();
        let prerequisites = context.prerequisite_stages(stage.as_str());
        let relevant: Vec<&String> = completed
            .iter()
            .filter(|s| prerequisites.contains(s))
            .collect();

        let remaining = max_tokens.saturating_sub(estimate_tokens(&base_context));
        let per_stage = if relevant.is_empty() {
            remaining
        } else {
            remaining / relevant.len()
        };

        for stage_name in &relevant {
            let Some(output) = context.stage_output(stage_name) else {
                continue;
            };
            if output.content.is_empty() {
                continue;
            }
            let mut content = output.content.clone();
            let content_tokens = estimate_tokens(&content);
            if content_tokens > per_stage {
                content = summarize_stage_output(&content, per_stage);
                info!(stage = %stage_name, from = content_tokens,
                      to = estimate_tokens(&content), "stage output summarized");
            }
            let agent_name = normalize_stage_name(stage_name)
                .and_then(|s| catalog.stage(s))
                .map(|s| s.agent_name)
                .unwrap_or(stage_name.as_str());
            current = format!("{current}\n===\n{agent_name} Agent: {content}\n===\n");
        }

        let remaining = max_tokens.saturating_sub(estimate_tokens(&current));
        if remaining > LOCAL_DOCS_MIN_TOKENS {
            let docs = self
                .load_local_documents(context.project_id, &context.project_name)
                .await;
            if !docs.is_empty() {
                let per_doc = remaining / docs.len();
                let mut doc_parts = vec!["\n## Local Documents\n".to_string()];
                for (name, content) in docs {
                    let content = if estimate_tokens(&content) > per_doc {
                        truncate_to_tokens(&content, per_doc)
                    } else {
                        content
                    };
                    doc_parts.push(format!("### {name}\n"));
                    doc_parts.push(content);
                    doc_parts.push("\n".to_string());
                }
                current.push_str(&doc_parts.join("\n"));
            }
        }

        let final_tokens = estimate_tokens(&current);
        if final_tokens > max_tokens {
            warn!(tokens = final_tokens, budget = max_tokens, "context over budget, truncating");
            current = truncate_to_tokens(&current, max_tokens);
        }
        current
    }

    /// Load the project's local key documents, trying the name dir
    /// first and the id dir second.
    async fn load_local_documents(
        &self,
        project_id: ResourceId,
        project_name: &str,
    ) -> Vec<(String, String)> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if !project_name.is_empty() {
            candidates.push(self.settings.projects_dir.join(project_name));
        }
        candidates.push(self.settings.projects_dir.join(project_id.to_string()));

        for dir in candidates {
            if !dir.is_dir() {
                continue;
            }
            let mut docs = Vec::new();
            for file in LOCAL_DOC_FILES {
                let path = dir.join(file);
                match tokio::fs::read_to_string(&path).await {
                    Ok(content) => docs.push((file.to_string(), content)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to read local document"),
                }
            }
            return docs;
        }
        Vec::new()
    }

    async fn load_rules(&self) -> String {
        self.rules_cache
            .get_or_init(|| async {
                match tokio::fs::read_to_string(&self.settings.rules_path).await {
                    Ok(rules) => rules,
                    Err(e) => {
                        warn!(path = %self.settings.rules_path.display(), error = %e,
                              "workflow rules unavailable");
                        String::new()
                    }
                }
            })
            .await
            .clone()
    }
}

/// Project status derivation used on every save: the control status
/// wins, then the context's stage-level status maps onto the project.
fn derive_project_status(context: &WorkflowContext) -> ProjectStatus {
    match context.control_status {
        ControlStatus::Paused => ProjectStatus::Paused,
        ControlStatus::Stopped => ProjectStatus::Cancelled,
        _ => match context.status {
            StageStatus::Running => ProjectStatus::Building,
            StageStatus::Completed => ProjectStatus::Completed,
            StageStatus::Failed => ProjectStatus::Failed,
            StageStatus::Pending | StageStatus::Skipped => {
                if context.current_stage.is_some() {
                    ProjectStatus::Building
                } else {
                    ProjectStatus::Pending
                }
            }
        },
    }
}

fn project_to_stage_status(status: ProjectStatus) -> StageStatus {
    match status {
        ProjectStatus::Building | ProjectStatus::Queued => StageStatus::Running,
        ProjectStatus::Completed => StageStatus::Completed,
        ProjectStatus::Failed => StageStatus::Failed,
        _ => StageStatus::Pending,
    }
}

/// Pull the intent analysis out of the orchestrator output.
fn parse_intent(content: &str) -> IntentAnalysis {
    let mut intent = IntentAnalysis {
        raw_analysis: content.to_string(),
        workflow_kind: "single_agent".to_string(),
        complexity: "medium".to_string(),
        ..Default::default()
    };

    if let Ok(re) = Regex::new(r#"(?i)agent[_\s]?name[:\s]*["'`]?([a-zA-Z0-9_]+)"#) {
        if let Some(captures) = re.captures(content) {
            intent.agent_name = captures[1].to_string();
        }
    }

    let lowered = content.to_lowercase();
    if lowered.contains("multi") && lowered.contains("agent") {
        intent.workflow_kind = "multi_agent".to_string();
    }
    intent
}
