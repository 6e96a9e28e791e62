//! Workflow engine for the Nexus platform.
//!
//! This crate contains the execution core:
//! - Context Manager: loads/saves workflow context, assembles the
//!   per-stage LLM input under a token budget
//! - Stage Executor: runs one stage against the LLM invoker
//! - Multi-Agent Iterator: fans iterative stages out per subagent
//! - Workflow Engine: sequences stages, honors control signals
//! - File Sync: cross-worker project file availability
//! - Workflow Service: project factory and control operations

pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod file_sync;
pub mod multi_agent;
pub mod service;

pub use context::{ContextManager, estimate_tokens, summarize_stage_output, truncate_to_tokens};
pub use engine::{ExecutionResult, WorkflowEngine, WorkflowOutcome};
pub use error::{EngineError, EngineResult};
pub use executor::StageExecutor;
pub use file_sync::{FileMetadataManager, FileSyncManager};
pub use multi_agent::MultiAgentIterator;
pub use service::WorkflowService;
