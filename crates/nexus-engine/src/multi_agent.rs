//! Multi-agent iteration.
//!
//! Four stages are structurally per-subagent. When the system
//! architecture declares more than one agent, those stages fan out
//! over the subagents in dependency order and the merged result
//! becomes the stage output, preserving the single-stage contract.

use chrono::Utc;
use nexus_core::agent::{AgentDefinition, MultiAgentArchitecture, OrchestrationPattern};
use nexus_core::context::WorkflowContext;
use nexus_core::stage::{StageMetrics, StageOutput, StageStatus};
use nexus_config::StageName;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

use crate::EngineResult;
use crate::executor::StageExecutor;

/// Extract the first fenced ```json block from a text, verifying it
/// parses.
pub(crate) fn extract_json_block(content: &str) -> Option<String> {
    let re = Regex::new(r"```json\s*([\s\S]*?)\s*```").ok()?;
    let captures = re.captures(content)?;
    let json = captures.get(1)?.as_str().trim().to_string();
    serde_json::from_str::<serde_json::Value>(&json).ok()?;
    Some(json)
}

/// Discovers the project's multi-agent architecture and orders the
/// fan-out.
pub struct MultiAgentIterator {
    architecture: Option<MultiAgentArchitecture>,
    /// Per-subagent progress for the stage currently fanning out.
    progress: HashMap<String, StageStatus>,
}

impl MultiAgentIterator {
    /// Parse the architecture from the completed system architecture
    /// stage output, if any.
    pub fn from_context(context: &WorkflowContext) -> Self {
        let architecture = context
            .stage_output(StageName::SystemArchitecture.as_str())
            .filter(|o| o.is_completed() && !o.content.is_empty())
            .and_then(|o| parse_architecture(&o.content));
        Self {
            architecture,
            progress: HashMap::new(),
        }
    }

    pub fn is_multi_agent(&self) -> bool {
        self.architecture
            .as_ref()
            .map(|a| a.is_multi_agent())
            .unwrap_or(false)
    }

    pub fn agent_count(&self) -> usize {
        self.architecture
            .as_ref()
            .map(|a| a.agent_count())
            .unwrap_or(1)
    }

    pub fn architecture(&self) -> Option<&MultiAgentArchitecture> {
        self.architecture.as_ref()
    }

    /// All subagents in execution order.
    pub fn ordered_agents(&self) -> Vec<AgentDefinition> {
        match &self.architecture {
            Some(architecture) => sort_by_dependency(&architecture.agents),
            None => Vec::new(),
        }
    }

    pub fn update_progress(&mut self, agent_name: &str, status: StageStatus) {
        self.progress.insert(agent_name.to_string(), status);
    }

    pub fn progress(&self, agent_name: &str) -> StageStatus {
        self.progress
            .get(agent_name)
            .copied()
            .unwrap_or(StageStatus::Pending)
    }

    /// Prefix the base context with the current subagent's definition
    /// and a short summary of its peers.
    pub fn format_agent_context(&self, agent: &AgentDefinition, base_context: &str) -> String {
        let mut block = format!(
            "\n## Current processing agent\n\n\
             - **Agent name**: {}\n\
             - **Agent type**: {}\n\
             - **Description**: {}\n\
             - **Orchestration pattern**: {}\n",
            agent.name,
            agent.agent_type,
            agent.description,
            agent.orchestration_pattern.as_str(),
        );
        if !agent.dependencies.is_empty() {
            block.push_str(&format!(
                "- **Dependencies**: {}\n",
                agent.dependencies.join(", ")
            ));
        }
        if !agent.tools.is_empty() {
            block.push_str(&format!("- **Tools**: {}\n", agent.tools.join(", ")));
        }

        if let Some(architecture) = &self.architecture {
            let others: Vec<&AgentDefinition> = architecture
                .agents
                .iter()
                .filter(|a| a.name != agent.name)
                .collect();
            if !others.is_empty() {
                block.push_str("\n## Other agents\n");
                for other in others {
                    let summary: String = other.description.chars().take(100).collect();
                    block.push_str(&format!(
                        "- **{}** ({}): {}\n",
                        other.name, other.agent_type, summary
                    ));
                }
            }
        }

        format!("{base_context}\n{block}")
    }
}

/// Run an iterative stage once per subagent and merge the results.
pub(crate) async fn execute_iterative_stage(
    executor: &StageExecutor,
    context: &WorkflowContext,
    mut iterator: MultiAgentIterator,
    stage: StageName,
    base_context: String,
    state: HashMap<String, serde_json::Value>,
) -> EngineResult<StageOutput> {
    let agents = iterator.ordered_agents();
    let total_agents = agents.len();
    let mut outputs = Vec::with_capacity(total_agents);

    for agent in &agents {
        info!(stage = %stage, agent = %agent.name, "executing stage for subagent");
        iterator.update_progress(&agent.name, StageStatus::Running);

        let agent_context = iterator.format_agent_context(agent, &base_context);
        let mut agent_state = state.clone();
        agent_state.insert(
            "current_agent".to_string(),
            serde_json::Value::String(agent.name.clone()),
        );
        agent_state.insert(
            "agent_type".to_string(),
            serde_json::Value::String(agent.agent_type.clone()),
        );
        agent_state.insert("is_multi_agent".to_string(), serde_json::Value::Bool(true));
        agent_state.insert(
            "total_agents".to_string(),
            serde_json::Value::from(total_agents),
        );

        let output = executor
            .execute_single_agent(context, stage, Some(agent_context), agent_state)
            .await?;

        iterator.update_progress(&agent.name, output.status);
        if output.is_failed() {
            warn!(stage = %stage, agent = %agent.name, "subagent execution failed");
        }
        outputs.push(output);
    }

    Ok(merge_outputs(stage, &agents, outputs))
}

/// Merge per-subagent outputs into the stage's single output:
/// `## <name>` sections joined by `---`, summed metrics, unioned
/// files; failed iff any subagent failed.
fn merge_outputs(
    stage: StageName,
    agents: &[AgentDefinition],
    outputs: Vec<StageOutput>,
) -> StageOutput {
    if outputs.is_empty() {
        return StageOutput {
            stage_name: stage.as_str().to_string(),
            completed_at: Some(Utc::now()),
            status: StageStatus::Completed,
            ..Default::default()
        };
    }
    if outputs.len() == 1 {
        return outputs.into_iter().next().unwrap();
    }

    let mut sections = Vec::with_capacity(outputs.len());
    let mut metrics = StageMetrics::default();
    let mut generated_files = Vec::new();
    let mut status = StageStatus::Completed;
    let mut errors = Vec::new();

    for (i, output) in outputs.iter().enumerate() {
        let agent_name = agents
            .get(i)
            .map(|a| a.name.as_str())
            .unwrap_or("unknown_agent");
        sections.push(format!("## {}\n\n{}", agent_name, output.content));

        metrics.input_tokens += output.metrics.input_tokens;
        metrics.output_tokens += output.metrics.output_tokens;
        metrics.execution_time_seconds += output.metrics.execution_time_seconds;
        metrics.tool_calls_count += output.metrics.tool_calls_count;
        if metrics.model_id.is_none() {
            metrics.model_id = output.metrics.model_id.clone();
        }

        for file in &output.generated_files {
            if !generated_files.contains(file) {
                generated_files.push(file.clone());
            }
        }

        if output.is_failed() {
            status = StageStatus::Failed;
            if let Some(message) = &output.error_message {
                errors.push(format!("{agent_name}: {message}"));
            }
        }
    }

    StageOutput {
        stage_name: stage.as_str().to_string(),
        content: sections.join("\n\n---\n\n"),
        blob_content_ref: None,
        metrics,
        generated_files,
        document: None,
        doc_path: None,
        completed_at: Some(Utc::now()),
        status,
        error_message: (!errors.is_empty()).then(|| errors.join("; ")),
    }
}

/// Parse the architecture from the system architecture output,
/// preferring the JSON block over markdown patterns.
pub fn parse_architecture(content: &str) -> Option<MultiAgentArchitecture> {
    parse_json_architecture(content).or_else(|| parse_markdown_architecture(content))
}

fn parse_json_architecture(content: &str) -> Option<MultiAgentArchitecture> {
    let json = extract_json_block(content)?;
    let value: serde_json::Value = serde_json::from_str(&json).ok()?;

    let agents_value = value.get("agents")?.as_array()?;
    if agents_value.len() <= 1 {
        return None;
    }

    let mut agents = Vec::with_capacity(agents_value.len());
    for entry in agents_value {
        let name = entry.get("name").and_then(|v| v.as_str()).unwrap_or("");
        if name.is_empty() {
            continue;
        }
        agents.push(AgentDefinition {
            name: name.to_string(),
            agent_type: entry
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("main")
                .to_string(),
            description: entry
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            orchestration_pattern: entry
                .get("orchestration_pattern")
                .and_then(|v| v.as_str())
                .and_then(OrchestrationPattern::parse)
                .unwrap_or_default(),
            dependencies: string_list(entry.get("dependencies")),
            tools: string_list(entry.get("tools")),
            status: StageStatus::Pending,
        });
    }
    if agents.len() <= 1 {
        return None;
    }

    let main_agent = value
        .get("main_agent")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| agents[0].name.clone());
    let orchestration_pattern = value
        .get("orchestration_pattern")
        .and_then(|v| v.as_str())
        .and_then(OrchestrationPattern::parse)
        .unwrap_or_default();

    info!(agents = agents.len(), "parsed multi-agent architecture from JSON");
    Some(MultiAgentArchitecture {
        agents,
        orchestration_pattern,
        main_agent,
    })
}

fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_markdown_architecture(content: &str) -> Option<MultiAgentArchitecture> {
    let mut agents = agents_from_sections(content);
    if agents.is_empty() {
        agents = agents_from_bullets(content);
    }
    if agents.is_empty() {
        agents = agents_from_table(content);
    }
    if agents.len() <= 1 {
        return None;
    }

    let lowered = content.to_lowercase();
    let orchestration_pattern = if lowered.contains("swarm") {
        OrchestrationPattern::Swarm
    } else if lowered.contains("graph") {
        OrchestrationPattern::Graph
    } else {
        OrchestrationPattern::AgentAsTool
    };

    // First agent typed (or named) main wins; otherwise the first
    // declared agent becomes main.
    let mut main_agent = String::new();
    for agent in agents.iter_mut() {
        if agent.agent_type == "main" || agent.name.to_lowercase().contains("main") {
            agent.agent_type = "main".to_string();
            main_agent = agent.name.clone();
            break;
        }
    }
    if main_agent.is_empty() {
        agents[0].agent_type = "main".to_string();
        main_agent = agents[0].name.clone();
    }

    info!(agents = agents.len(), "parsed multi-agent architecture from markdown");
    Some(MultiAgentArchitecture {
        agents,
        orchestration_pattern,
        main_agent,
    })
}

/// `## Agent: <name>` sections, description running to the next
/// heading.
fn agents_from_sections(content: &str) -> Vec<AgentDefinition> {
    let heading = Regex::new(r"^##\s*Agent[:\s]+([A-Za-z0-9_]+)\s*$").unwrap();
    let mut agents: Vec<AgentDefinition> = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in content.lines() {
        if let Some(captures) = heading.captures(line.trim_end()) {
            if let Some((name, body)) = current.take() {
                agents.push(section_agent(name, &body));
            }
            current = Some((captures[1].to_string(), Vec::new()));
        } else if line.starts_with("##") {
            if let Some((name, body)) = current.take() {
                agents.push(section_agent(name, &body));
            }
        } else if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }
    if let Some((name, body)) = current.take() {
        agents.push(section_agent(name, &body));
    }
    agents
}

fn section_agent(name: String, body: &[&str]) -> AgentDefinition {
    let description: String = body.join("\n").trim().chars().take(200).collect();
    AgentDefinition {
        description,
        ..AgentDefinition::new(name)
    }
}

/// `- **<name>**: <description>` bullets.
fn agents_from_bullets(content: &str) -> Vec<AgentDefinition> {
    let bullet = Regex::new(r"^-\s*\*\*([A-Za-z0-9_]+)\*\*[:\s]*(.*)$").unwrap();
    content
        .lines()
        .filter_map(|line| {
            let captures = bullet.captures(line.trim())?;
            let description: String = captures[2].trim().chars().take(200).collect();
            Some(AgentDefinition {
                description,
                ..AgentDefinition::new(captures[1].to_string())
            })
        })
        .collect()
}

/// `| name | type | description |` table rows, header rows skipped.
fn agents_from_table(content: &str) -> Vec<AgentDefinition> {
    let row = Regex::new(r"^\|\s*([A-Za-z0-9_]+)\s*\|\s*(\w+)\s*\|\s*([^|]*)\|").unwrap();
    content
        .lines()
        .filter_map(|line| {
            let captures = row.captures(line.trim())?;
            let name = captures[1].to_string();
            if matches!(name.to_lowercase().as_str(), "name" | "agent") {
                return None;
            }
            let description: String = captures[3].trim().chars().take(200).collect();
            Some(AgentDefinition {
                agent_type: captures[2].to_lowercase(),
                description,
                ..AgentDefinition::new(name)
            })
        })
        .collect()
}

/// Topological sort over dependencies, declaration order for ties.
/// Cycles are broken by appending the remaining agents in declaration
/// order rather than failing.
fn sort_by_dependency(agents: &[AgentDefinition]) -> Vec<AgentDefinition> {
    let mut sorted: Vec<AgentDefinition> = Vec::with_capacity(agents.len());
    let mut processed: HashSet<String> = HashSet::new();
    let known: HashSet<&str> = agents.iter().map(|a| a.name.as_str()).collect();

    while sorted.len() < agents.len() {
        let before = sorted.len();
        for agent in agents {
            if processed.contains(&agent.name) {
                continue;
            }
            let ready = agent
                .dependencies
                .iter()
                .filter(|dep| known.contains(dep.as_str()))
                .all(|dep| processed.contains(dep));
            if ready {
                processed.insert(agent.name.clone());
                sorted.push(agent.clone());
            }
        }
        if sorted.len() == before {
            for agent in agents {
                if !processed.contains(&agent.name) {
                    processed.insert(agent.name.clone());
                    sorted.push(agent.clone());
                }
            }
            break;
        }
    }
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(name: &str, deps: &[&str]) -> AgentDefinition {
        AgentDefinition {
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            ..AgentDefinition::new(name)
        }
    }

    #[test]
    fn json_architecture_parses() {
        let content = r#"
Here is the architecture:
```json
{
  "agents": [
    {"name": "coordinator", "type": "main", "description": "routes work",
     "dependencies": [], "tools": ["router"]},
    {"name": "pricing", "type": "sub", "description": "prices things",
     "dependencies": ["coordinator"], "tools": []}
  ],
  "orchestration_pattern": "swarm",
  "main_agent": "coordinator"
}
```
"#;
        let architecture = parse_architecture(content).unwrap();
        assert_eq!(architecture.agent_count(), 2);
        assert_eq!(architecture.main_agent, "coordinator");
        assert_eq!(
            architecture.orchestration_pattern,
            OrchestrationPattern::Swarm
        );
        assert_eq!(architecture.agents[1].dependencies, vec!["coordinator"]);
    }

    #[test]
    fn single_agent_json_is_not_multi() {
        let content = "```json\n{\"agents\": [{\"name\": \"solo\"}]}\n```";
        assert!(parse_architecture(content).is_none());
    }

    #[test]
    fn markdown_sections_parse() {
        let content = "\
# Architecture

## Agent: collector
Gathers raw data.

## Agent: reporter
Writes the report.

## Deployment
n/a";
        let architecture = parse_architecture(content).unwrap();
        assert_eq!(architecture.agent_count(), 2);
        assert_eq!(architecture.agents[0].name, "collector");
        assert_eq!(architecture.agents[0].description, "Gathers raw data.");
        // No agent typed main: the first declared becomes main.
        assert_eq!(architecture.main_agent, "collector");
        assert_eq!(architecture.agents[0].agent_type, "main");
    }

    #[test]
    fn markdown_bullets_parse() {
        let content = "\
Agents:
- **searcher**: finds documents
- **ranker**: orders results";
        let architecture = parse_architecture(content).unwrap();
        assert_eq!(architecture.agent_count(), 2);
        assert_eq!(architecture.agents[1].name, "ranker");
    }

    #[test]
    fn markdown_table_parses_and_skips_header() {
        let content = "\
| name | type | description |
| --- | --- | --- |
| planner | main | plans the work |
| executor_a | sub | does the work |";
        let architecture = parse_architecture(content).unwrap();
        assert_eq!(architecture.agent_count(), 2);
        assert_eq!(architecture.agents[0].name, "planner");
        assert_eq!(architecture.agents[0].agent_type, "main");
        assert_eq!(architecture.main_agent, "planner");
    }

    #[test]
    fn dependency_order_with_ties_by_declaration() {
        let agents = vec![
            agent("b", &["a"]),
            agent("c", &["a"]),
            agent("a", &[]),
        ];
        let order: Vec<String> = sort_by_dependency(&agents)
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn cycles_break_by_appending_declaration_order() {
        let agents = vec![agent("x", &["y"]), agent("y", &["x"]), agent("z", &[])];
        let order: Vec<String> = sort_by_dependency(&agents)
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(order, vec!["z", "x", "y"]);
    }

    #[test]
    fn unknown_dependencies_are_ignored() {
        let agents = vec![agent("a", &["ghost"]), agent("b", &["a"])];
        let order: Vec<String> = sort_by_dependency(&agents)
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn merge_combines_sections_metrics_and_status() {
        let agents = vec![agent("a", &[]), agent("b", &[])];
        let outputs = vec![
            StageOutput {
                stage_name: "agent_design".into(),
                content: "design for a".into(),
                status: StageStatus::Completed,
                metrics: StageMetrics {
                    input_tokens: 10,
                    output_tokens: 5,
                    execution_time_seconds: 1.0,
                    tool_calls_count: 2,
                    model_id: Some("model-x".into()),
                },
                ..Default::default()
            },
            StageOutput {
                stage_name: "agent_design".into(),
                content: "design for b".into(),
                status: StageStatus::Failed,
                error_message: Some("boom".into()),
                metrics: StageMetrics {
                    input_tokens: 1,
                    output_tokens: 1,
                    execution_time_seconds: 0.5,
                    tool_calls_count: 0,
                    model_id: None,
                },
                ..Default::default()
            },
        ];

        let merged = merge_outputs(StageName::AgentDesign, &agents, outputs);
        assert!(merged.content.contains("## a"));
        assert!(merged.content.contains("## b"));
        assert!(merged.content.contains("\n\n---\n\n"));
        assert_eq!(merged.metrics.input_tokens, 11);
        assert_eq!(merged.metrics.tool_calls_count, 2);
        assert_eq!(merged.status, StageStatus::Failed);
        assert_eq!(merged.error_message.as_deref(), Some("b: boom"));
    }
}
