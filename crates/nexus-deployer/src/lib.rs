//! Deployment of built agents to the managed runtime.
//!
//! The runtime itself is an external collaborator behind the
//! [`AgentRuntime`] trait; this crate materializes project artifacts
//! from stage documents, writes the build recipe, submits the launch
//! and keeps the Agent record truthful on every path.

pub mod runtime;
pub mod service;

pub use runtime::{AgentRuntime, HttpAgentRuntime, LaunchSpec, RuntimeLaunch, RuntimeState};
pub use service::{DeployOptions, DeploymentOutcome, DeploymentService};
