//! Deployment service.
//!
//! After a successful build: materialize any missing project
//! artifacts from the stage documents, write a minimal build recipe,
//! submit the launch to the managed runtime, and record the runtime
//! handles on the Agent record. Every failure path rolls the record
//! back to offline/failed and removes the temporary recipe.

use chrono::Utc;
use nexus_core::ResourceId;
use nexus_core::agent::{Agent, AgentStatus, DeploymentStatus, RuntimeHandles};
use nexus_core::project::Project;
use nexus_core::{Error, Result};
use nexus_db::{AgentRepo, ProjectRepo, StageRepo};
use nexus_config::{Settings, StageName};
use nexus_engine::FileSyncManager;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::runtime::{AgentRuntime, LaunchSpec, RuntimeState};

/// How long to wait for the runtime to become ready.
const READY_POLL_ATTEMPTS: u32 = 30;
const READY_POLL_INTERVAL: Duration = Duration::from_secs(10);

const RECIPE_FILE: &str = ".nexus_deploy.json";

/// Deployment knobs.
#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    /// Stop after configuration; nothing is written or launched.
    pub dry_run: bool,
    /// Deploy under this agent id instead of minting a new one.
    pub agent_id: Option<ResourceId>,
}

/// What a deployment produced.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentOutcome {
    pub agent_id: ResourceId,
    pub agent_name: String,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

#[derive(Debug, Serialize)]
struct BuildRecipe<'a> {
    agent_name: &'a str,
    entry_point: &'a str,
    requirements: &'a str,
    project_id: String,
}

/// Packages build artifacts and submits them to the managed runtime.
pub struct DeploymentService {
    projects: Arc<dyn ProjectRepo>,
    stages: Arc<dyn StageRepo>,
    agents: Arc<dyn AgentRepo>,
    runtime: Arc<dyn AgentRuntime>,
    file_sync: Arc<FileSyncManager>,
    settings: Settings,
}

impl DeploymentService {
    pub fn new(
        projects: Arc<dyn ProjectRepo>,
        stages: Arc<dyn StageRepo>,
        agents: Arc<dyn AgentRepo>,
        runtime: Arc<dyn AgentRuntime>,
        file_sync: Arc<FileSyncManager>,
        settings: Settings,
    ) -> Self {
        Self {
            projects,
            stages,
            agents,
            runtime,
            file_sync,
            settings,
        }
    }

    /// Deploy the artifacts of a completed build.
    pub async fn deploy(
        &self,
        project_id: ResourceId,
        options: DeployOptions,
    ) -> Result<DeploymentOutcome> {
        let project = self
            .projects
            .get(project_id)
            .await
            .map_err(|e| Error::DeploymentFailed(e.to_string()))?;
        let agent_name = self.agent_name(&project);
        let agent_id = options.agent_id.unwrap_or_else(ResourceId::new);

        info!(project_id = %project_id, agent = %agent_name, dry_run = options.dry_run,
              "starting deployment");

        if options.dry_run {
            return Ok(DeploymentOutcome {
                agent_id,
                agent_name,
                dry_run: true,
                runtime_id: None,
                endpoint: None,
            });
        }

        // Make sure the project artifacts are present on this worker.
        self.file_sync
            .sync_from_blob(project_id, &project.project_name, None)
            .await
            .map_err(|e| Error::DeploymentFailed(e.to_string()))?;

        let project_dir = self.project_dir(&project);
        self.materialize_artifacts(project_id, &project_dir).await?;

        let capabilities = self.extract_capabilities(project_id).await;
        let description = self.agent_description(project_id, &project).await;

        // The record exists (deploying) before the runtime is touched
        // so a crash leaves an auditable trail.
        let now = Utc::now();
        let agent = Agent {
            agent_id,
            agent_name: agent_name.clone(),
            description,
            project_id,
            status: AgentStatus::Offline,
            deployment_status: DeploymentStatus::Deploying,
            runtime: RuntimeHandles::default(),
            capabilities,
            invocation_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.agents
            .upsert(&agent)
            .await
            .map_err(|e| Error::DeploymentFailed(e.to_string()))?;

        let recipe_path = self.write_recipe(&project, &agent_name)?;
        let result = self.launch(&project, &agent_name).await;
        // The recipe is scratch input for the runtime submission;
        // never leave it in the repo root.
        if let Err(e) = std::fs::remove_file(&recipe_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %recipe_path.display(), error = %e, "failed to clean build recipe");
            }
        }

        match result {
            Ok(launch) => {
                let handles = RuntimeHandles {
                    runtime_id: Some(launch.runtime_id.clone()),
                    endpoint: launch.endpoint.clone(),
                    version: launch.version.clone(),
                };
                self.agents
                    .set_deployment_state(
                        agent_id,
                        AgentStatus::Running,
                        DeploymentStatus::Deployed,
                        Some(handles),
                        None,
                    )
                    .await
                    .map_err(|e| Error::DeploymentFailed(e.to_string()))?;
                info!(agent_id = %agent_id, runtime_id = %launch.runtime_id,
                      "agent deployed");
                Ok(DeploymentOutcome {
                    agent_id,
                    agent_name,
                    dry_run: false,
                    runtime_id: Some(launch.runtime_id),
                    endpoint: launch.endpoint,
                })
            }
            Err(e) => {
                error!(agent_id = %agent_id, error = %e, "deployment failed, rolling back");
                if let Err(rollback) = self
                    .agents
                    .set_deployment_state(
                        agent_id,
                        AgentStatus::Offline,
                        DeploymentStatus::Failed,
                        None,
                        Some(e.to_string()),
                    )
                    .await
                {
                    error!(agent_id = %agent_id, error = %rollback,
                           "failed to record deployment failure");
                }
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        project: &Project,
        agent_name: &str,
    ) -> Result<crate::runtime::RuntimeLaunch> {
        let spec = LaunchSpec {
            agent_name: agent_name.to_string(),
            project_id: project.project_id.to_string(),
            entry_point: "main".to_string(),
            artifact_prefix: format!(
                "{}{}/",
                self.settings.blob_prefix, project.project_id
            ),
            env: HashMap::new(),
        };

        let launch = self.runtime.launch(&spec).await?;

        for attempt in 0..READY_POLL_ATTEMPTS {
            match self.runtime.status(&launch.runtime_id).await? {
                RuntimeState::Ready => return Ok(launch),
                RuntimeState::Failed(message) => {
                    return Err(Error::DeploymentFailed(format!(
                        "runtime reported failure: {message}"
                    )));
                }
                RuntimeState::Provisioning => {
                    if attempt + 1 < READY_POLL_ATTEMPTS {
                        tokio::time::sleep(READY_POLL_INTERVAL).await;
                    }
                }
            }
        }
        Err(Error::Timeout(format!(
            "runtime {} not ready after {} attempts",
            launch.runtime_id, READY_POLL_ATTEMPTS
        )))
    }

    fn agent_name(&self, project: &Project) -> String {
        project
            .metadata
            .get("agent_name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| project.project_name.clone())
    }

    fn project_dir(&self, project: &Project) -> PathBuf {
        let by_name = self.settings.projects_dir.join(&project.project_name);
        if by_name.is_dir() {
            return by_name;
        }
        self.settings
            .projects_dir
            .join(project.project_id.to_string())
    }

    /// Fill in artifacts a stage described but never wrote to disk:
    /// the agent entry point, the prompt file and the tool modules.
    async fn materialize_artifacts(
        &self,
        project_id: ResourceId,
        project_dir: &Path,
    ) -> Result<()> {
        std::fs::create_dir_all(project_dir)
            .map_err(|e| Error::DeploymentFailed(format!("cannot create project dir: {e}")))?;

        let entry = project_dir.join("main.py");
        if !entry.exists() {
            if let Some(code) = self
                .stage_document(project_id, StageName::AgentCodeDeveloper)
                .await
                .as_deref()
                .and_then(first_python_block)
            {
                std::fs::write(&entry, code)
                    .map_err(|e| Error::DeploymentFailed(e.to_string()))?;
                info!(path = %entry.display(), "materialized agent entry point");
            }
        }

        let prompt = project_dir.join("prompt.yaml");
        if !prompt.exists() {
            if let Some(content) = self
                .stage_document(project_id, StageName::PromptEngineer)
                .await
            {
                std::fs::write(&prompt, content)
                    .map_err(|e| Error::DeploymentFailed(e.to_string()))?;
                info!(path = %prompt.display(), "materialized prompt file");
            }
        }

        let tools_dir = project_dir.join("tools");
        if !tools_dir.exists() {
            if let Some(document) = self
                .stage_document(project_id, StageName::ToolsDeveloper)
                .await
            {
                let blocks = python_blocks(&document);
                if !blocks.is_empty() {
                    std::fs::create_dir_all(&tools_dir)
                        .map_err(|e| Error::DeploymentFailed(e.to_string()))?;
                    for (i, block) in blocks.iter().enumerate() {
                        let path = tools_dir.join(format!("tool_{i}.py"));
                        std::fs::write(&path, block)
                            .map_err(|e| Error::DeploymentFailed(e.to_string()))?;
                    }
                    info!(count = blocks.len(), "materialized tool modules");
                }
            }
        }

        let requirements = project_dir.join("requirements.txt");
        if !requirements.exists() {
            std::fs::write(&requirements, "")
                .map_err(|e| Error::DeploymentFailed(e.to_string()))?;
        }
        Ok(())
    }

    async fn stage_document(
        &self,
        project_id: ResourceId,
        stage: StageName,
    ) -> Option<String> {
        match self.stages.get(project_id, stage.as_str()).await {
            Ok(record) => record
                .design_document
                .map(|d| d.content)
                .or(record.agent_output_content)
                .filter(|c| !c.is_empty()),
            Err(e) => {
                warn!(stage = %stage, error = %e, "stage document unavailable");
                None
            }
        }
    }

    /// Capabilities come out of the agent-design JSON, with a
    /// markdown-bullet fallback.
    async fn extract_capabilities(&self, project_id: ResourceId) -> Vec<String> {
        let Some(document) = self
            .stage_document(project_id, StageName::AgentDesign)
            .await
        else {
            return Vec::new();
        };
        capabilities_from_document(&document)
    }

    async fn agent_description(&self, project_id: ResourceId, project: &Project) -> String {
        if let Some(document) = self
            .stage_document(project_id, StageName::AgentDesign)
            .await
        {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&document) {
                if let Some(description) = value.get("description").and_then(|v| v.as_str()) {
                    return description.to_string();
                }
            }
        }
        let requirement: String = project.requirement.chars().take(200).collect();
        requirement
    }

    fn write_recipe(&self, project: &Project, agent_name: &str) -> Result<PathBuf> {
        let recipe = BuildRecipe {
            agent_name,
            entry_point: "main",
            requirements: "requirements.txt",
            project_id: project.project_id.to_string(),
        };
        let path = PathBuf::from(RECIPE_FILE);
        let bytes = serde_json::to_vec_pretty(&recipe)
            .map_err(|e| Error::DeploymentFailed(e.to_string()))?;
        std::fs::write(&path, bytes).map_err(|e| Error::DeploymentFailed(e.to_string()))?;
        Ok(path)
    }
}

/// All fenced ```python blocks of a document.
fn python_blocks(document: &str) -> Vec<String> {
    let re = Regex::new(r"```python\s*\n([\s\S]*?)```").unwrap();
    re.captures_iter(document)
        .map(|c| c[1].trim_end().to_string())
        .filter(|b| !b.is_empty())
        .collect()
}

fn first_python_block(document: &str) -> Option<String> {
    python_blocks(document).into_iter().next()
}

/// Capability list from a design document: the JSON `capabilities`
/// field, or bullets under a `Capabilities` heading.
fn capabilities_from_document(document: &str) -> Vec<String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(document) {
        if let Some(capabilities) = value.get("capabilities").and_then(|v| v.as_array()) {
            return capabilities
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
        }
    }

    let mut capabilities = Vec::new();
    let mut in_section = false;
    for line in document.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('#') {
            in_section = trimmed.to_lowercase().contains("capabilities");
            continue;
        }
        if in_section {
            if let Some(item) = trimmed.strip_prefix("- ") {
                capabilities.push(item.trim().to_string());
            }
        }
    }
    capabilities
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_blocks_extract() {
        let document = "\
intro
```python
def main():
    pass
```
notes
```python
def helper():
    return 1
```";
        let blocks = python_blocks(document);
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].contains("def main"));
        assert!(blocks[1].contains("def helper"));
        assert_eq!(first_python_block("no code").as_deref(), None);
    }

    #[test]
    fn capabilities_from_json_document() {
        let document = r#"{"name": "pricer", "capabilities": ["compare prices", "forecast"]}"#;
        assert_eq!(
            capabilities_from_document(document),
            vec!["compare prices", "forecast"]
        );
    }

    #[test]
    fn capabilities_from_markdown_fallback() {
        let document = "\
# Design
## Capabilities
- fetch pricing
- summarize results

## Something else
- not a capability";
        assert_eq!(
            capabilities_from_document(document),
            vec!["fetch pricing", "summarize results"]
        );
    }
}
