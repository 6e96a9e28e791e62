//! The LLM invoker trait.
//!
//! The model is an external collaborator: given a prompt template and
//! an assembled context, it returns text plus token counts plus the
//! tool-call side effects it performed against the project directory.
//! Stage executions are at-least-once; implementations are expected
//! to keep their file-writing tool calls re-applicable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::Result;

/// One invocation request for a pipeline stage.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Prompt template path from the stage catalog.
    pub template: String,
    /// The assembled stage context.
    pub context: String,
    /// Invoker state (`project_id`, `project_name`, multi-agent keys).
    pub state: HashMap<String, serde_json::Value>,
}

impl LlmRequest {
    pub fn new(template: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            context: context.into(),
            state: HashMap::new(),
        }
    }

    pub fn with_state(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.state.insert(key.into(), value);
        self
    }
}

/// A tool call the model performed during an invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// What an invocation produced. Token counts and model id are
/// best-effort; absent fields surface as zeros / None.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tool_calls: Vec<ToolCallRecord>,
    pub model_id: Option<String>,
}

/// Trait for the external LLM service.
#[async_trait]
pub trait LlmInvoker: Send + Sync {
    /// Run one stage invocation to completion.
    async fn invoke(&self, request: LlmRequest) -> Result<LlmResponse>;
}
