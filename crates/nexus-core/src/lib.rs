//! Core domain types and traits for the Nexus workflow platform.
//!
//! This crate contains:
//! - Resource identifiers and common types
//! - Project, Stage, Task and Agent records
//! - The in-memory workflow context and stage outputs
//! - Multi-agent architecture types
//! - The LLM invoker trait (the platform's opaque model seam)
//! - The blob store trait (cross-worker file share)

pub mod agent;
pub mod blob;
pub mod context;
pub mod error;
pub mod id;
pub mod llm;
pub mod project;
pub mod stage;
pub mod task;

pub use error::{Error, Result};
pub use id::ResourceId;
