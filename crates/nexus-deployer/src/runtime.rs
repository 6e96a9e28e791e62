//! Managed-runtime client trait.

use async_trait::async_trait;
use nexus_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What the runtime needs to launch an agent.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchSpec {
    pub agent_name: String,
    pub project_id: String,
    /// Module path of the agent entry point.
    pub entry_point: String,
    /// Blob-store prefix holding the project artifacts.
    pub artifact_prefix: String,
    pub env: HashMap<String, String>,
}

/// Handles returned by a successful launch.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeLaunch {
    pub runtime_id: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Observed state of a launched runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeState {
    Provisioning,
    Ready,
    Failed(String),
}

/// Trait for managed agent runtimes.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Name of this runtime backend.
    fn name(&self) -> &'static str;

    /// Submit an agent for launch.
    async fn launch(&self, spec: &LaunchSpec) -> Result<RuntimeLaunch>;

    /// Current state of a launched runtime.
    async fn status(&self, runtime_id: &str) -> Result<RuntimeState>;

    /// Tear a runtime down.
    async fn destroy(&self, runtime_id: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

/// HTTP client for the managed runtime control API.
pub struct HttpAgentRuntime {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAgentRuntime {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl AgentRuntime for HttpAgentRuntime {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<RuntimeLaunch> {
        let response = self
            .client
            .post(self.url("runtimes"))
            .json(spec)
            .send()
            .await
            .map_err(|e| Error::DeploymentFailed(format!("launch request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::DeploymentFailed(format!(
                "runtime rejected launch: {}",
                response.status()
            )));
        }
        response
            .json::<RuntimeLaunch>()
            .await
            .map_err(|e| Error::DeploymentFailed(format!("bad launch response: {e}")))
    }

    async fn status(&self, runtime_id: &str) -> Result<RuntimeState> {
        let response = self
            .client
            .get(self.url(&format!("runtimes/{runtime_id}")))
            .send()
            .await
            .map_err(|e| Error::DeploymentFailed(format!("status request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::DeploymentFailed(format!(
                "runtime status error: {}",
                response.status()
            )));
        }
        let status: StatusResponse = response
            .json()
            .await
            .map_err(|e| Error::DeploymentFailed(format!("bad status response: {e}")))?;
        Ok(match status.status.as_str() {
            "ready" | "running" => RuntimeState::Ready,
            "failed" => RuntimeState::Failed(
                status.message.unwrap_or_else(|| "runtime failed".to_string()),
            ),
            _ => RuntimeState::Provisioning,
        })
    }

    async fn destroy(&self, runtime_id: &str) -> Result<()> {
        self.client
            .delete(self.url(&format!("runtimes/{runtime_id}")))
            .send()
            .await
            .map_err(|e| Error::DeploymentFailed(format!("destroy request failed: {e}")))?;
        Ok(())
    }
}
