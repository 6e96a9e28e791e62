//! The in-memory workflow context.
//!
//! Assembled from the record store at the start of a run, owned by
//! the engine for its duration, and persisted back after every stage
//! transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ResourceId;
use crate::project::{AggregatedMetrics, ControlStatus, WorkflowType};
use crate::stage::{StageOutput, StageStatus};

/// Intent analysis extracted from the orchestrator stage output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntentAnalysis {
    pub agent_name: String,
    pub agent_description: String,
    /// `single_agent` or `multi_agent`.
    pub workflow_kind: String,
    pub complexity: String,
    pub key_features: Vec<String>,
    pub tool_requirements: Vec<String>,
    pub raw_analysis: String,
}

/// Everything the engine needs in memory while running one project.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    pub project_id: ResourceId,
    pub project_name: String,
    pub requirement: String,
    pub intent: Option<IntentAnalysis>,
    /// Keyed by stage name; `stage_outputs[s].stage_name == s`.
    pub stage_outputs: HashMap<String, StageOutput>,
    /// Static workflow rules text, included verbatim in contexts.
    pub rules: String,
    pub current_stage: Option<String>,
    pub status: StageStatus,
    pub control_status: ControlStatus,
    pub aggregated_metrics: AggregatedMetrics,
    pub workflow_type: WorkflowType,
    /// Configured stage order for `workflow_type`.
    pub stage_order: Vec<String>,
    pub pause_requested_at: Option<DateTime<Utc>>,
    pub stop_requested_at: Option<DateTime<Utc>>,
    pub resume_from_stage: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl WorkflowContext {
    pub fn new(
        project_id: ResourceId,
        workflow_type: WorkflowType,
        stage_order: Vec<String>,
    ) -> Self {
        Self {
            project_id,
            project_name: String::new(),
            requirement: String::new(),
            intent: None,
            stage_outputs: HashMap::new(),
            rules: String::new(),
            current_stage: None,
            status: StageStatus::Pending,
            control_status: ControlStatus::Running,
            aggregated_metrics: AggregatedMetrics::default(),
            workflow_type,
            stage_order,
            pause_requested_at: None,
            stop_requested_at: None,
            resume_from_stage: None,
            created_at: None,
            updated_at: None,
        }
    }

    /// Completed stages in configured order.
    pub fn completed_stages(&self) -> Vec<String> {
        self.stage_order
            .iter()
            .filter(|name| {
                self.stage_outputs
                    .get(*name)
                    .map(|o| o.is_completed())
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Stages not yet completed, in configured order.
    pub fn pending_stages(&self) -> Vec<String> {
        self.stage_order
            .iter()
            .filter(|name| {
                !self
                    .stage_outputs
                    .get(*name)
                    .map(|o| o.is_completed())
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// The next stage to execute, or None when all are completed.
    pub fn next_stage(&self) -> Option<String> {
        self.pending_stages().into_iter().next()
    }

    pub fn stage_output(&self, stage_name: &str) -> Option<&StageOutput> {
        self.stage_outputs.get(stage_name)
    }

    /// Record a stage output, folding completed metrics into the
    /// aggregate exactly once.
    ///
    /// A re-run that re-completes the same stage replaces the prior
    /// output; its previously folded metrics are backed out first so
    /// the aggregate never double-counts.
    pub fn update_stage_output(&mut self, output: StageOutput) {
        if let Some(previous) = self.stage_outputs.get(&output.stage_name) {
            if previous.is_completed() {
                let m = &previous.metrics;
                let agg = &mut self.aggregated_metrics;
                agg.total_input_tokens = agg.total_input_tokens.saturating_sub(m.input_tokens);
                agg.total_output_tokens =
                    agg.total_output_tokens.saturating_sub(m.output_tokens);
                agg.total_tokens = agg.total_input_tokens + agg.total_output_tokens;
                agg.total_execution_time =
                    (agg.total_execution_time - m.execution_time_seconds).max(0.0);
                agg.total_tool_calls = agg.total_tool_calls.saturating_sub(m.tool_calls_count);
            }
        }
        if output.is_completed() {
            self.aggregated_metrics.add_stage_metrics(&output.metrics);
        }
        self.updated_at = Some(Utc::now());
        self.stage_outputs
            .insert(output.stage_name.clone(), output);
    }

    /// Stages strictly before `stage_name` in configured order.
    pub fn prerequisite_stages(&self, stage_name: &str) -> Vec<String> {
        match self.stage_order.iter().position(|s| s == stage_name) {
            Some(index) => self.stage_order[..index].to_vec(),
            None => Vec::new(),
        }
    }

    pub fn prerequisites_completed(&self, stage_name: &str) -> bool {
        let completed: std::collections::HashSet<_> =
            self.completed_stages().into_iter().collect();
        self.prerequisite_stages(stage_name)
            .iter()
            .all(|p| completed.contains(p))
    }

    /// `completed / total * 100` over the configured order.
    pub fn progress(&self) -> f64 {
        if self.stage_order.is_empty() {
            return 0.0;
        }
        self.completed_stages().len() as f64 / self.stage_order.len() as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageMetrics;

    fn completed(stage: &str, input_tokens: u64) -> StageOutput {
        StageOutput {
            stage_name: stage.to_string(),
            content: format!("{stage} output"),
            status: StageStatus::Completed,
            metrics: StageMetrics {
                input_tokens,
                output_tokens: 10,
                execution_time_seconds: 1.0,
                tool_calls_count: 1,
                model_id: None,
            },
            ..Default::default()
        }
    }

    fn context() -> WorkflowContext {
        WorkflowContext::new(
            ResourceId::new(),
            WorkflowType::AgentBuild,
            vec!["a".into(), "b".into(), "c".into()],
        )
    }

    #[test]
    fn completed_stages_follow_configured_order() {
        let mut ctx = context();
        ctx.update_stage_output(completed("c", 1));
        ctx.update_stage_output(completed("a", 1));
        assert_eq!(ctx.completed_stages(), vec!["a", "c"]);
        assert_eq!(ctx.pending_stages(), vec!["b"]);
        assert_eq!(ctx.next_stage().as_deref(), Some("b"));
    }

    #[test]
    fn prerequisites_are_strict_prefix() {
        let ctx = context();
        assert!(ctx.prerequisite_stages("a").is_empty());
        assert_eq!(ctx.prerequisite_stages("c"), vec!["a", "b"]);
        assert!(ctx.prerequisite_stages("unknown").is_empty());
    }

    #[test]
    fn metrics_fold_exactly_once_on_rerun() {
        let mut ctx = context();
        ctx.update_stage_output(completed("a", 100));
        assert_eq!(ctx.aggregated_metrics.total_input_tokens, 100);

        // Re-running the same stage replaces, never double-counts.
        ctx.update_stage_output(completed("a", 40));
        assert_eq!(ctx.aggregated_metrics.total_input_tokens, 40);
        assert_eq!(ctx.aggregated_metrics.total_output_tokens, 10);
        assert_eq!(ctx.aggregated_metrics.total_tokens, 50);
        assert_eq!(ctx.aggregated_metrics.total_tool_calls, 1);
    }

    #[test]
    fn progress_percentage() {
        let mut ctx = context();
        assert_eq!(ctx.progress(), 0.0);
        ctx.update_stage_output(completed("a", 1));
        assert!((ctx.progress() - 100.0 / 3.0).abs() < 1e-9);
        ctx.update_stage_output(completed("b", 1));
        ctx.update_stage_output(completed("c", 1));
        assert_eq!(ctx.progress(), 100.0);
    }
}
