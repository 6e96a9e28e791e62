//! Repository traits and implementations.

pub mod agent;
pub mod project;
pub mod stage;
pub mod task;

pub use agent::{AgentRepo, PgAgentRepo};
pub use project::{PgProjectRepo, ProjectRepo, ProjectUpdate};
pub use stage::{PgStageRepo, StageRepo, StageSeed, StageUpdate};
pub use task::{PgTaskRepo, TaskRepo};
