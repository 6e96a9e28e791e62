//! Deployed-agent records and multi-agent architecture types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;
use crate::stage::StageStatus;

/// Runtime status of a deployed agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Running,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Running => "running",
            AgentStatus::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(AgentStatus::Running),
            "offline" => Some(AgentStatus::Offline),
            _ => None,
        }
    }
}

/// Outcome of the last deployment attempt for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Deploying,
    Deployed,
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Deployed => "deployed",
            DeploymentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deploying" => Some(DeploymentStatus::Deploying),
            "deployed" => Some(DeploymentStatus::Deployed),
            "failed" => Some(DeploymentStatus::Failed),
            _ => None,
        }
    }
}

/// Handles into the managed runtime for a deployed agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeHandles {
    pub runtime_id: Option<String>,
    pub endpoint: Option<String>,
    pub version: Option<String>,
}

/// Lifecycle record of a deployed artifact.
///
/// Invocation counters are advisory and may lag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: ResourceId,
    pub agent_name: String,
    pub description: String,
    /// The project that built this agent.
    pub project_id: ResourceId,
    pub status: AgentStatus,
    pub deployment_status: DeploymentStatus,
    pub runtime: RuntimeHandles,
    pub capabilities: Vec<String>,
    pub invocation_count: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// How subagents of a multi-agent project are wired together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationPattern {
    #[default]
    AgentAsTool,
    Swarm,
    Graph,
}

impl OrchestrationPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestrationPattern::AgentAsTool => "agent_as_tool",
            OrchestrationPattern::Swarm => "swarm",
            OrchestrationPattern::Graph => "graph",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "agent_as_tool" => Some(OrchestrationPattern::AgentAsTool),
            "swarm" => Some(OrchestrationPattern::Swarm),
            "graph" => Some(OrchestrationPattern::Graph),
            _ => None,
        }
    }
}

/// One subagent declared by the system architecture stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    /// `main`, `sub` or `tool`.
    pub agent_type: String,
    pub description: String,
    pub orchestration_pattern: OrchestrationPattern,
    pub dependencies: Vec<String>,
    pub tools: Vec<String>,
    #[serde(default)]
    pub status: StageStatus,
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agent_type: "sub".to_string(),
            description: String::new(),
            orchestration_pattern: OrchestrationPattern::default(),
            dependencies: Vec::new(),
            tools: Vec::new(),
            status: StageStatus::Pending,
        }
    }
}

/// The multi-agent architecture discovered for a project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultiAgentArchitecture {
    pub agents: Vec<AgentDefinition>,
    pub orchestration_pattern: OrchestrationPattern,
    pub main_agent: String,
}

impl MultiAgentArchitecture {
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn is_multi_agent(&self) -> bool {
        self.agents.len() > 1
    }

    pub fn get_agent(&self, name: &str) -> Option<&AgentDefinition> {
        self.agents.iter().find(|a| a.name == name)
    }
}
