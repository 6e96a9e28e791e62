//! HTTP client for the LLM invocation service.
//!
//! The model service owns prompt templates and tool execution; this
//! client hands it a template name plus the assembled context and
//! reads back text, token counts and the tool-call trace.

use async_trait::async_trait;
use nexus_core::llm::{LlmInvoker, LlmRequest, LlmResponse, ToolCallRecord};
use nexus_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Serialize)]
struct InvokeRequest<'a> {
    template: &'a str,
    context: &'a str,
    state: &'a HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct InvokeResponse {
    text: String,
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    tool_calls: Vec<ToolCallRecord>,
    #[serde(default)]
    model_id: Option<String>,
}

/// [`LlmInvoker`] over the invocation service's HTTP API.
pub struct HttpLlmInvoker {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpLlmInvoker {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl LlmInvoker for HttpLlmInvoker {
    async fn invoke(&self, request: LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/invoke", self.endpoint.trim_end_matches('/'));
        let body = InvokeRequest {
            template: &request.template,
            context: &request.context,
            state: &request.state,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::InvocationFailed(format!("invoke request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::InvocationFailed(format!(
                "invocation service returned {}",
                response.status()
            )));
        }

        let payload: InvokeResponse = response
            .json()
            .await
            .map_err(|e| Error::InvocationFailed(format!("bad invoke response: {e}")))?;
        Ok(LlmResponse {
            text: payload.text,
            input_tokens: payload.input_tokens,
            output_tokens: payload.output_tokens,
            tool_calls: payload.tool_calls,
            model_id: payload.model_id,
        })
    }
}
