//! Task records and the queue message format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ResourceId;
use crate::project::WorkflowType;

/// The kind of work a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    BuildAgent,
    UpdateAgent,
    BuildTool,
    DeployAgent,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::BuildAgent => "build_agent",
            TaskType::UpdateAgent => "update_agent",
            TaskType::BuildTool => "build_tool",
            TaskType::DeployAgent => "deploy_agent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "build_agent" => Some(TaskType::BuildAgent),
            "update_agent" => Some(TaskType::UpdateAgent),
            "build_tool" => Some(TaskType::BuildTool),
            "deploy_agent" => Some(TaskType::DeployAgent),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a task. Terminal statuses are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "queued" => Some(TaskStatus::Queued),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the worker should drive the engine for this message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    #[default]
    Execute,
    Resume,
    Restart,
}

/// A queue-visible unit of work referencing a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: ResourceId,
    pub task_type: TaskType,
    pub project_id: ResourceId,
    pub status: TaskStatus,
    pub priority: i32,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Body of a build-queue message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: ResourceId,
    pub project_id: ResourceId,
    pub task_type: TaskType,
    pub workflow_type: WorkflowType,
    pub requirement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub priority: i32,
    #[serde(default)]
    pub action: TaskAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_stage: Option<String>,
    #[serde(default = "default_true")]
    pub execute_to_completion: bool,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}
