//! Engine error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("prerequisites not met for stage {stage}: missing {missing:?}")]
    Prerequisite {
        stage: String,
        missing: Vec<String>,
    },

    #[error("unknown stage: {0}")]
    UnknownStage(String),

    #[error("stage {stage} failed: {message}")]
    StageExecution {
        stage: String,
        message: String,
        /// Recoverable failures are re-attempted on redelivery.
        recoverable: bool,
    },

    #[error("invalid control transition: {0}")]
    InvalidTransition(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Db(#[from] nexus_db::DbError),

    #[error(transparent)]
    Core(#[from] nexus_core::Error),
}

impl EngineError {
    pub fn stage_execution(stage: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::StageExecution {
            stage: stage.into(),
            message: message.into(),
            recoverable: true,
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
