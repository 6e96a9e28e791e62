//! End-to-end engine scenarios over in-memory stores.

mod common;

use common::Harness;
use nexus_core::project::{ControlStatus, ProjectStatus, WorkflowType};
use nexus_core::stage::StageStatus;
use nexus_engine::{WorkflowEngine, WorkflowOutcome};
use std::collections::HashMap;

fn engine(harness: &Harness, project_id: nexus_core::ResourceId) -> WorkflowEngine {
    WorkflowEngine::new(
        project_id,
        harness.context_manager.clone(),
        harness.invoker.clone(),
    )
}

#[tokio::test]
async fn happy_path_runs_all_nine_stages() {
    let harness = Harness::new();
    let project_id = harness.seed_project(WorkflowType::AgentBuild).await;

    let result = engine(&harness, project_id)
        .execute_to_completion(HashMap::new())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.final_status, WorkflowOutcome::Completed);
    assert_eq!(result.completed_stages.len(), 9);
    assert_eq!(result.completed_stages[0], "orchestrator");
    assert_eq!(result.completed_stages[8], "agent_deployer");

    let project = harness.projects.snapshot(project_id).unwrap();
    assert_eq!(project.status, ProjectStatus::Completed);
    assert_eq!(project.progress, 100.0);
    assert!(project.aggregated_metrics.total_tokens > 0);

    for stage in ["orchestrator", "system_architecture", "agent_deployer"] {
        let record = harness.stages.snapshot(project_id, stage).unwrap();
        assert_eq!(record.status, StageStatus::Completed, "stage {stage}");
        assert!(record.completed_at.is_some());
        assert!(record.metrics.is_some());
    }
}

#[tokio::test]
async fn prerequisite_violation_fails_fast() {
    let harness = Harness::new();
    let project_id = harness.seed_project(WorkflowType::AgentBuild).await;

    let result = engine(&harness, project_id)
        .execute_from_stage("prompt_engineer", true, HashMap::new())
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.final_status, WorkflowOutcome::Failed);
    assert_eq!(
        result.missing_prerequisites,
        vec![
            "orchestrator",
            "requirements_analysis",
            "system_architecture",
            "agent_design",
            "tools_developer",
        ]
    );
    // Nothing was attempted.
    assert_eq!(harness.invoker.call_count(), 0);
}

#[tokio::test]
async fn pause_lands_after_current_stage_persists() {
    let harness = Harness::new();
    let project_id = harness.seed_project(WorkflowType::AgentBuild).await;

    // The user pauses while requirements analysis is running.
    let projects = harness.projects.clone();
    harness.invoker.on_invoke(move |stage| {
        if stage == "requirements_analysis" {
            projects.set_control(project_id, ControlStatus::Paused);
        }
    });

    let result = engine(&harness, project_id)
        .execute_to_completion(HashMap::new())
        .await
        .unwrap();

    assert_eq!(result.final_status, WorkflowOutcome::Paused);
    assert_eq!(
        result.completed_stages,
        vec!["orchestrator", "requirements_analysis"]
    );
    // The in-flight stage finished and was persisted; nothing further
    // started.
    assert_eq!(harness.invoker.call_count(), 2);
    let record = harness
        .stages
        .snapshot(project_id, "requirements_analysis")
        .unwrap();
    assert_eq!(record.status, StageStatus::Completed);

    let project = harness.projects.snapshot(project_id).unwrap();
    assert_eq!(project.status, ProjectStatus::Paused);
    let arch = harness
        .stages
        .snapshot(project_id, "system_architecture")
        .unwrap();
    assert_eq!(arch.status, StageStatus::Pending);
}

#[tokio::test]
async fn stop_cancels_without_interrupting_the_stage() {
    let harness = Harness::new();
    let project_id = harness.seed_project(WorkflowType::ToolBuild).await;

    let projects = harness.projects.clone();
    harness.invoker.on_invoke(move |stage| {
        if stage == "tools_developer" {
            projects.set_control(project_id, ControlStatus::Stopped);
        }
    });

    let result = engine(&harness, project_id)
        .execute_to_completion(HashMap::new())
        .await
        .unwrap();

    assert_eq!(result.final_status, WorkflowOutcome::Stopped);
    assert_eq!(
        result.error_message.as_deref(),
        Some("Workflow stopped by user")
    );
    // The running stage completed; the next one never started.
    assert_eq!(harness.invoker.call_count(), 2);
    let record = harness
        .stages
        .snapshot(project_id, "tools_developer")
        .unwrap();
    assert_eq!(record.status, StageStatus::Completed);

    let project = harness.projects.snapshot(project_id).unwrap();
    assert_eq!(project.status, ProjectStatus::Cancelled);
}

#[tokio::test]
async fn failed_stage_resumes_on_redelivery_without_double_counting() {
    let harness = Harness::new();
    let project_id = harness.seed_project(WorkflowType::ToolBuild).await;
    harness.invoker.fail_once("tools_developer");

    let result = engine(&harness, project_id)
        .execute_to_completion(HashMap::new())
        .await
        .unwrap();

    assert_eq!(result.final_status, WorkflowOutcome::Failed);
    assert_eq!(result.failed_stage.as_deref(), Some("tools_developer"));
    assert!(
        result
            .error_message
            .as_deref()
            .unwrap()
            .contains("transient model failure")
    );

    let project = harness.projects.snapshot(project_id).unwrap();
    assert_eq!(project.status, ProjectStatus::Failed);
    let error_info = project.error_info.unwrap();
    assert_eq!(error_info.failed_stage.as_deref(), Some("tools_developer"));

    let record = harness
        .stages
        .snapshot(project_id, "tools_developer")
        .unwrap();
    assert_eq!(record.status, StageStatus::Failed);
    assert!(record.error_message.is_some());

    // Redelivery: a fresh engine naturally skips the completed stage
    // and re-runs the failed one.
    let result = engine(&harness, project_id)
        .execute_to_completion(HashMap::new())
        .await
        .unwrap();
    assert!(result.success);

    let project = harness.projects.snapshot(project_id).unwrap();
    assert_eq!(project.status, ProjectStatus::Completed);
    // Three stages completed exactly once each at 120 input tokens.
    assert_eq!(project.aggregated_metrics.total_input_tokens, 360);
    assert_eq!(project.aggregated_metrics.total_output_tokens, 135);
}

#[tokio::test]
async fn oversize_output_offloads_to_blob_store() {
    use nexus_core::blob::BlobStore as _;

    let harness = Harness::new();
    let project_id = harness.seed_project(WorkflowType::ToolBuild).await;
    let big = "z".repeat(600 * 1024);
    harness.invoker.respond_with("requirements_analysis", big.clone());

    let result = engine(&harness, project_id)
        .execute_to_completion(HashMap::new())
        .await
        .unwrap();
    assert!(result.success);

    let record = harness
        .stages
        .snapshot(project_id, "requirements_analysis")
        .unwrap();
    assert_eq!(record.agent_output_content.as_deref(), Some(""));
    let blob_ref = record.agent_output_blob_ref.unwrap();
    assert!(blob_ref.ends_with("/outputs/requirements_analysis.txt"));

    // The blob carries the identical bytes.
    let bytes = harness.blob.get(&blob_ref).await.unwrap();
    assert_eq!(bytes.len(), big.len());
    assert_eq!(String::from_utf8(bytes).unwrap(), big);

    // A reloading reader sees the full content again.
    let context = harness
        .context_manager
        .load_from_db(project_id)
        .await
        .unwrap();
    let output = context.stage_output("requirements_analysis").unwrap();
    assert_eq!(output.content.len(), big.len());
}

const THREE_AGENT_ARCHITECTURE: &str = r#"
The system splits into three agents.

```json
{
  "agents": [
    {"name": "collector", "type": "main", "description": "gathers pricing data",
     "dependencies": [], "tools": ["http_get"]},
    {"name": "analyzer", "type": "sub", "description": "computes comparisons",
     "dependencies": ["collector"], "tools": []},
    {"name": "reporter", "type": "sub", "description": "writes the summary",
     "dependencies": ["collector"], "tools": ["file_write"]}
  ],
  "orchestration_pattern": "agent_as_tool",
  "main_agent": "collector"
}
```
"#;

#[tokio::test]
async fn multi_agent_stages_fan_out_in_dependency_order() {
    let harness = Harness::new();
    let project_id = harness.seed_project(WorkflowType::AgentBuild).await;
    harness
        .invoker
        .respond_with("system_architecture", THREE_AGENT_ARCHITECTURE);

    let result = engine(&harness, project_id)
        .execute_to_completion(HashMap::new())
        .await
        .unwrap();
    assert!(result.success);

    // 3 single stages + 4 iterative stages x 3 subagents + 2 single.
    assert_eq!(harness.invoker.call_count(), 3 + 12 + 2);

    let design_calls = harness.invoker.calls_for("agent_design");
    assert_eq!(design_calls.len(), 3);
    let order: Vec<&str> = design_calls
        .iter()
        .map(|c| c.state["current_agent"].as_str().unwrap())
        .collect();
    assert_eq!(order, vec!["collector", "analyzer", "reporter"]);
    for call in &design_calls {
        assert_eq!(call.state["is_multi_agent"], serde_json::json!(true));
        assert_eq!(call.state["total_agents"], serde_json::json!(3));
        assert!(call.context.contains("## Current processing agent"));
        assert!(call.context.contains("## Other agents"));
    }

    // Merged output carries one section per subagent with summed
    // metrics.
    let record = harness.stages.snapshot(project_id, "agent_design").unwrap();
    assert_eq!(record.status, StageStatus::Completed);
    let content = record.agent_output_content.unwrap();
    assert!(content.contains("## collector"));
    assert!(content.contains("## analyzer"));
    assert!(content.contains("## reporter"));
    assert!(content.contains("\n\n---\n\n"));
    let metrics = record.metrics.unwrap();
    assert_eq!(metrics.input_tokens, 3 * 120);
    assert_eq!(metrics.output_tokens, 3 * 45);
}

#[tokio::test]
async fn single_agent_architecture_keeps_single_path() {
    let harness = Harness::new();
    let project_id = harness.seed_project(WorkflowType::AgentBuild).await;
    harness.invoker.respond_with(
        "system_architecture",
        "```json\n{\"agents\": [{\"name\": \"solo\"}]}\n```",
    );

    let result = engine(&harness, project_id)
        .execute_to_completion(HashMap::new())
        .await
        .unwrap();
    assert!(result.success);
    // One invocation per stage, no fan-out.
    assert_eq!(harness.invoker.call_count(), 9);
}

#[tokio::test]
async fn context_includes_prior_stage_outputs_and_rules() {
    let harness = Harness::new();
    let project_id = harness.seed_project(WorkflowType::ToolBuild).await;

    let result = engine(&harness, project_id)
        .execute_to_completion(HashMap::new())
        .await
        .unwrap();
    assert!(result.success);

    // The second stage's input carries the first stage's output in
    // the `<Agent> Agent:` block format plus the kickoff sections.
    let calls = harness.invoker.calls_for("tools_developer");
    assert_eq!(calls.len(), 1);
    let context = &calls[0].context;
    assert!(context.contains("# Build Workflow Kickoff"));
    assert!(context.contains("rule: build carefully"));
    assert!(context.contains("## Original user requirement"));
    assert!(context.contains("Build an AWS pricing agent"));
    assert!(context.contains("===\nRequirements Analyzer Agent:"));
    assert!(context.contains("output for requirements_analysis"));
}

#[tokio::test]
async fn single_stage_mode_does_not_complete_the_project() {
    let harness = Harness::new();
    let project_id = harness.seed_project(WorkflowType::ToolBuild).await;

    let result = engine(&harness, project_id)
        .execute_from_stage("requirements_analysis", false, HashMap::new())
        .await
        .unwrap();

    // Only the requested stage ran and is reported.
    assert_eq!(result.final_status, WorkflowOutcome::Completed);
    assert_eq!(result.completed_stages, vec!["requirements_analysis"]);
    assert_eq!(harness.invoker.call_count(), 1);

    // The project is mid-pipeline, not completed.
    let project = harness.projects.snapshot(project_id).unwrap();
    assert_eq!(project.status, ProjectStatus::Building);
    assert!(project.progress < 100.0);
    let next = harness
        .stages
        .snapshot(project_id, "tools_developer")
        .unwrap();
    assert_eq!(next.status, StageStatus::Pending);

    // A later full run finishes the remaining stages.
    let result = engine(&harness, project_id)
        .execute_to_completion(HashMap::new())
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(harness.invoker.call_count(), 3);
    let project = harness.projects.snapshot(project_id).unwrap();
    assert_eq!(project.status, ProjectStatus::Completed);
}

#[tokio::test]
async fn execute_single_stage_checks_prerequisites() {
    let harness = Harness::new();
    let project_id = harness.seed_project(WorkflowType::ToolBuild).await;

    let mut engine = engine(&harness, project_id);
    let err = engine
        .execute_single_stage("tools_developer", None, HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        nexus_engine::EngineError::Prerequisite { .. }
    ));

    // The first stage has no prerequisites and runs alone.
    let output = engine
        .execute_single_stage("requirements_analysis", None, HashMap::new())
        .await
        .unwrap();
    assert_eq!(output.status, StageStatus::Completed);
    assert_eq!(harness.invoker.call_count(), 1);

    let project = harness.projects.snapshot(project_id).unwrap();
    assert_eq!(
        project.current_stage.as_deref(),
        Some("requirements_analysis")
    );
}

#[tokio::test]
async fn legacy_stage_spellings_resolve() {
    let harness = Harness::new();
    let project_id = harness.seed_project(WorkflowType::ToolBuild).await;

    let mut engine = engine(&harness, project_id);
    let output = engine
        .execute_single_stage("requirements_analyzer", None, HashMap::new())
        .await
        .unwrap();
    assert_eq!(output.stage_name, "requirements_analysis");
}

#[tokio::test]
async fn restart_from_first_stage_zeroes_recomputed_metrics() {
    use nexus_db::StageRepo as _;

    let harness = Harness::new();
    let project_id = harness.seed_project(WorkflowType::ToolBuild).await;
    engine(&harness, project_id)
        .execute_to_completion(HashMap::new())
        .await
        .unwrap();
    assert!(
        harness
            .projects
            .snapshot(project_id)
            .unwrap()
            .aggregated_metrics
            .total_tokens
            > 0
    );

    // Restart from the first stage clears every stage record.
    harness.stages.reset_from(project_id, 1).await.unwrap();

    let context = harness
        .context_manager
        .load_from_db(project_id)
        .await
        .unwrap();
    assert!(context.completed_stages().is_empty());
    assert_eq!(context.aggregated_metrics.total_tokens, 0);
    assert_eq!(context.aggregated_metrics.total_tool_calls, 0);
}

#[tokio::test]
async fn completed_project_reports_completed_without_rerun() {
    let harness = Harness::new();
    let project_id = harness.seed_project(WorkflowType::ToolBuild).await;

    engine(&harness, project_id)
        .execute_to_completion(HashMap::new())
        .await
        .unwrap();
    let calls_after_first = harness.invoker.call_count();

    // Crash-recovery redelivery of an already-finished project.
    let result = engine(&harness, project_id)
        .execute_to_completion(HashMap::new())
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.completed_stages.len(), 3);
    assert_eq!(harness.invoker.call_count(), calls_after_first);
}
