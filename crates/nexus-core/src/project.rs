//! Project records and project-level execution state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ResourceId;
use crate::stage::StageMetrics;

/// Which stage catalog a project runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    AgentBuild,
    AgentUpdate,
    ToolBuild,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::AgentBuild => "agent_build",
            WorkflowType::AgentUpdate => "agent_update",
            WorkflowType::ToolBuild => "tool_build",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "agent_build" => Some(WorkflowType::AgentBuild),
            "agent_update" => Some(WorkflowType::AgentUpdate),
            "tool_build" => Some(WorkflowType::ToolBuild),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Pending,
    Queued,
    Building,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Pending => "pending",
            ProjectStatus::Queued => "queued",
            ProjectStatus::Building => "building",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Failed => "failed",
            ProjectStatus::Paused => "paused",
            ProjectStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ProjectStatus::Pending),
            "queued" => Some(ProjectStatus::Queued),
            "building" => Some(ProjectStatus::Building),
            "completed" => Some(ProjectStatus::Completed),
            "failed" => Some(ProjectStatus::Failed),
            "paused" => Some(ProjectStatus::Paused),
            "cancelled" => Some(ProjectStatus::Cancelled),
            _ => None,
        }
    }

    /// Once terminal, only tags and error info may still mutate.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProjectStatus::Completed | ProjectStatus::Failed | ProjectStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-requested execution intent, independent of project status.
///
/// Writer-exclusive to the control path; the engine only reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ControlStatus {
    #[default]
    Running,
    Paused,
    Stopped,
    Cancelled,
}

impl ControlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlStatus::Running => "running",
            ControlStatus::Paused => "paused",
            ControlStatus::Stopped => "stopped",
            ControlStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(ControlStatus::Running),
            "paused" => Some(ControlStatus::Paused),
            "stopped" => Some(ControlStatus::Stopped),
            "cancelled" => Some(ControlStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ControlStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure information attached to a failed project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

/// Running totals over all completed stages of a project.
///
/// Folded in exactly once per completed stage; monotonically
/// non-decreasing over the project lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedMetrics {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub total_execution_time: f64,
    pub total_tool_calls: u64,
}

impl AggregatedMetrics {
    pub fn add_stage_metrics(&mut self, metrics: &StageMetrics) {
        self.total_input_tokens += metrics.input_tokens;
        self.total_output_tokens += metrics.output_tokens;
        self.total_tokens = self.total_input_tokens + self.total_output_tokens;
        self.total_execution_time += metrics.execution_time_seconds;
        self.total_tool_calls += metrics.tool_calls_count;
    }
}

/// A single end-to-end build run, owning its pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub project_id: ResourceId,
    pub project_name: String,
    pub workflow_type: WorkflowType,
    /// Free-form user requirement text.
    pub requirement: String,
    pub status: ProjectStatus,
    pub control_status: ControlStatus,
    pub current_stage: Option<String>,
    /// `completed_stages / total_stages * 100`.
    pub progress: f64,
    pub priority: i32,
    pub tags: Vec<String>,
    pub user_id: Option<String>,
    pub error_info: Option<ErrorInfo>,
    pub aggregated_metrics: AggregatedMetrics,
    pub pause_requested_at: Option<DateTime<Utc>>,
    pub stop_requested_at: Option<DateTime<Utc>>,
    pub resume_from_stage: Option<String>,
    /// Workflow-specific keys (`agent_id` for updates, `tool_name`
    /// for tool builds, ...).
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(ProjectStatus::Completed.is_terminal());
        assert!(ProjectStatus::Failed.is_terminal());
        assert!(ProjectStatus::Cancelled.is_terminal());
        assert!(!ProjectStatus::Building.is_terminal());
        assert!(!ProjectStatus::Paused.is_terminal());
    }

    #[test]
    fn aggregated_metrics_fold() {
        let mut agg = AggregatedMetrics::default();
        agg.add_stage_metrics(&StageMetrics {
            input_tokens: 100,
            output_tokens: 50,
            execution_time_seconds: 2.5,
            tool_calls_count: 3,
            model_id: None,
        });
        agg.add_stage_metrics(&StageMetrics {
            input_tokens: 10,
            output_tokens: 5,
            execution_time_seconds: 0.5,
            tool_calls_count: 0,
            model_id: None,
        });
        assert_eq!(agg.total_input_tokens, 110);
        assert_eq!(agg.total_output_tokens, 55);
        assert_eq!(agg.total_tokens, 165);
        assert_eq!(agg.total_tool_calls, 3);
        assert!((agg.total_execution_time - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn status_round_trip() {
        for s in [
            "pending",
            "queued",
            "building",
            "completed",
            "failed",
            "paused",
            "cancelled",
        ] {
            assert_eq!(ProjectStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(ProjectStatus::parse("bogus").is_none());
    }
}
