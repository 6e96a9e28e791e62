//! Workflow stage catalogs.
//!
//! Every place that needs stage information goes through this module;
//! stage names are a sum type and legacy spellings are normalized
//! exactly once, at the boundary.

use nexus_core::project::WorkflowType;
use serde::{Deserialize, Serialize};

/// Canonical stage names across all workflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Orchestrator,
    RequirementsAnalysis,
    SystemArchitecture,
    AgentDesign,
    ToolsDeveloper,
    PromptEngineer,
    AgentCodeDeveloper,
    AgentDeveloperManager,
    AgentDeployer,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Orchestrator => "orchestrator",
            StageName::RequirementsAnalysis => "requirements_analysis",
            StageName::SystemArchitecture => "system_architecture",
            StageName::AgentDesign => "agent_design",
            StageName::ToolsDeveloper => "tools_developer",
            StageName::PromptEngineer => "prompt_engineer",
            StageName::AgentCodeDeveloper => "agent_code_developer",
            StageName::AgentDeveloperManager => "agent_developer_manager",
            StageName::AgentDeployer => "agent_deployer",
        }
    }

    /// Parse a canonical stage name. Legacy spellings go through
    /// [`normalize_stage_name`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "orchestrator" => Some(StageName::Orchestrator),
            "requirements_analysis" => Some(StageName::RequirementsAnalysis),
            "system_architecture" => Some(StageName::SystemArchitecture),
            "agent_design" => Some(StageName::AgentDesign),
            "tools_developer" => Some(StageName::ToolsDeveloper),
            "prompt_engineer" => Some(StageName::PromptEngineer),
            "agent_code_developer" => Some(StageName::AgentCodeDeveloper),
            "agent_developer_manager" => Some(StageName::AgentDeveloperManager),
            "agent_deployer" => Some(StageName::AgentDeployer),
            _ => None,
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalize a stage name, accepting the legacy spellings still
/// present in old records. The alias map is frozen; new workflows use
/// canonical names from day one.
pub fn normalize_stage_name(name: &str) -> Option<StageName> {
    let lowered = name.to_ascii_lowercase();
    match lowered.as_str() {
        "requirements_analyzer" => Some(StageName::RequirementsAnalysis),
        "system_architect" => Some(StageName::SystemArchitecture),
        "agent_designer" => Some(StageName::AgentDesign),
        "tool_developer" => Some(StageName::ToolsDeveloper),
        other => StageName::parse(other),
    }
}

/// One entry of a workflow's ordered stage list.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub name: StageName,
    /// 1-indexed position in the workflow.
    pub order: i32,
    pub display_name: &'static str,
    /// Agent display name used in context formatting.
    pub agent_name: &'static str,
    pub prompt_template: &'static str,
    /// Whether the stage fans out per subagent on multi-agent projects.
    pub iterative: bool,
}

/// The ordered stage list for one workflow type.
#[derive(Debug, Clone)]
pub struct WorkflowCatalog {
    pub workflow_type: WorkflowType,
    pub stages: Vec<StageSpec>,
}

impl WorkflowCatalog {
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name.as_str().to_string()).collect()
    }

    pub fn stage(&self, name: StageName) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn contains(&self, name: StageName) -> bool {
        self.stage(name).is_some()
    }

    /// Stages strictly before `name` in configured order.
    pub fn prerequisites(&self, name: StageName) -> Vec<StageName> {
        match self.stages.iter().position(|s| s.name == name) {
            Some(index) => self.stages[..index].iter().map(|s| s.name).collect(),
            None => Vec::new(),
        }
    }

    pub fn total_stages(&self) -> usize {
        self.stages.len()
    }
}

fn spec(
    name: StageName,
    order: i32,
    display_name: &'static str,
    agent_name: &'static str,
    prompt_template: &'static str,
    iterative: bool,
) -> StageSpec {
    StageSpec {
        name,
        order,
        display_name,
        agent_name,
        prompt_template,
        iterative,
    }
}

/// The static catalog for a workflow type.
pub fn workflow_catalog(workflow_type: WorkflowType) -> WorkflowCatalog {
    let stages = match workflow_type {
        WorkflowType::AgentBuild => vec![
            spec(
                StageName::Orchestrator,
                1,
                "Orchestrator",
                "Orchestrator",
                "prompts/agent_build_workflow/orchestrator",
                false,
            ),
            spec(
                StageName::RequirementsAnalysis,
                2,
                "Requirements Analysis",
                "Requirements Analyzer",
                "prompts/agent_build_workflow/requirements_analysis",
                false,
            ),
            spec(
                StageName::SystemArchitecture,
                3,
                "System Architecture",
                "System Architect",
                "prompts/agent_build_workflow/system_architecture",
                false,
            ),
            spec(
                StageName::AgentDesign,
                4,
                "Agent Design",
                "Agent Designer",
                "prompts/agent_build_workflow/agent_design",
                true,
            ),
            spec(
                StageName::ToolsDeveloper,
                5,
                "Tools Development",
                "Tools Developer",
                "prompts/agent_build_workflow/tools_developer",
                true,
            ),
            spec(
                StageName::PromptEngineer,
                6,
                "Prompt Engineering",
                "Prompt Engineer",
                "prompts/agent_build_workflow/prompt_engineer",
                true,
            ),
            spec(
                StageName::AgentCodeDeveloper,
                7,
                "Agent Code Development",
                "Agent Code Developer",
                "prompts/agent_build_workflow/agent_code_developer",
                true,
            ),
            spec(
                StageName::AgentDeveloperManager,
                8,
                "Development Management",
                "Agent Developer Manager",
                "prompts/agent_build_workflow/agent_developer_manager",
                false,
            ),
            spec(
                StageName::AgentDeployer,
                9,
                "Agent Deployment",
                "Agent Deployer",
                "prompts/agent_build_workflow/agent_deployer",
                false,
            ),
        ],
        WorkflowType::AgentUpdate => vec![
            spec(
                StageName::RequirementsAnalysis,
                1,
                "Requirements Analysis",
                "Requirements Analyzer",
                "prompts/agent_update_workflow/requirements_analysis",
                false,
            ),
            spec(
                StageName::SystemArchitecture,
                2,
                "System Architecture",
                "System Architect",
                "prompts/agent_update_workflow/system_architecture",
                false,
            ),
            spec(
                StageName::AgentDesign,
                3,
                "Agent Design",
                "Agent Designer",
                "prompts/agent_update_workflow/agent_design",
                true,
            ),
            spec(
                StageName::PromptEngineer,
                4,
                "Prompt Engineering",
                "Prompt Engineer",
                "prompts/agent_update_workflow/prompt_engineer",
                true,
            ),
            spec(
                StageName::AgentCodeDeveloper,
                5,
                "Agent Code Development",
                "Agent Code Developer",
                "prompts/agent_update_workflow/agent_code_developer",
                true,
            ),
            spec(
                StageName::AgentDeveloperManager,
                6,
                "Development Management",
                "Agent Developer Manager",
                "prompts/agent_update_workflow/agent_developer_manager",
                false,
            ),
        ],
        WorkflowType::ToolBuild => vec![
            spec(
                StageName::RequirementsAnalysis,
                1,
                "Requirements Analysis",
                "Requirements Analyzer",
                "prompts/tool_build_workflow/requirements_analysis",
                false,
            ),
            spec(
                StageName::ToolsDeveloper,
                2,
                "Tools Development",
                "Tools Developer",
                "prompts/tool_build_workflow/tools_developer",
                true,
            ),
            spec(
                StageName::AgentDeveloperManager,
                3,
                "Development Management",
                "Agent Developer Manager",
                "prompts/tool_build_workflow/agent_developer_manager",
                false,
            ),
        ],
    };

    WorkflowCatalog {
        workflow_type,
        stages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_build_has_nine_ordered_stages() {
        let catalog = workflow_catalog(WorkflowType::AgentBuild);
        assert_eq!(catalog.total_stages(), 9);
        for (i, stage) in catalog.stages.iter().enumerate() {
            assert_eq!(stage.order, i as i32 + 1);
        }
        assert_eq!(catalog.stages[0].name, StageName::Orchestrator);
        assert_eq!(catalog.stages[8].name, StageName::AgentDeployer);
    }

    #[test]
    fn iterative_stages() {
        let catalog = workflow_catalog(WorkflowType::AgentBuild);
        let iterative: Vec<_> = catalog
            .stages
            .iter()
            .filter(|s| s.iterative)
            .map(|s| s.name)
            .collect();
        assert_eq!(
            iterative,
            vec![
                StageName::AgentDesign,
                StageName::ToolsDeveloper,
                StageName::PromptEngineer,
                StageName::AgentCodeDeveloper,
            ]
        );
    }

    #[test]
    fn prerequisites_are_strict_prefix() {
        let catalog = workflow_catalog(WorkflowType::AgentBuild);
        assert!(catalog.prerequisites(StageName::Orchestrator).is_empty());
        assert_eq!(
            catalog.prerequisites(StageName::SystemArchitecture),
            vec![StageName::Orchestrator, StageName::RequirementsAnalysis]
        );
    }

    #[test]
    fn legacy_aliases_normalize() {
        assert_eq!(
            normalize_stage_name("requirements_analyzer"),
            Some(StageName::RequirementsAnalysis)
        );
        assert_eq!(
            normalize_stage_name("system_architect"),
            Some(StageName::SystemArchitecture)
        );
        assert_eq!(
            normalize_stage_name("agent_designer"),
            Some(StageName::AgentDesign)
        );
        assert_eq!(
            normalize_stage_name("tool_developer"),
            Some(StageName::ToolsDeveloper)
        );
        // Canonical names pass through unchanged.
        assert_eq!(
            normalize_stage_name("prompt_engineer"),
            Some(StageName::PromptEngineer)
        );
        assert_eq!(normalize_stage_name("not_a_stage"), None);
    }

    #[test]
    fn update_and_tool_catalogs_use_canonical_names() {
        for wt in [WorkflowType::AgentUpdate, WorkflowType::ToolBuild] {
            let catalog = workflow_catalog(wt);
            assert!(!catalog.stages.is_empty());
            for stage in &catalog.stages {
                assert_eq!(
                    normalize_stage_name(stage.name.as_str()),
                    Some(stage.name)
                );
            }
        }
    }
}
