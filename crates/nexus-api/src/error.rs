//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use nexus_engine::EngineError;

use crate::envelope::ApiResponse;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(ApiResponse::error(message))).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InvalidInput(msg) => ApiError::BadRequest(msg),
            EngineError::UnknownStage(stage) => {
                ApiError::BadRequest(format!("unknown stage: {stage}"))
            }
            EngineError::Prerequisite { .. } => ApiError::BadRequest(err.to_string()),
            EngineError::InvalidTransition(msg) => ApiError::Conflict(msg),
            EngineError::Db(nexus_db::DbError::NotFound(msg)) => ApiError::NotFound(msg),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<nexus_db::DbError> for ApiError {
    fn from(err: nexus_db::DbError) -> Self {
        match err {
            nexus_db::DbError::NotFound(msg) => ApiError::NotFound(msg),
            nexus_db::DbError::Duplicate(msg) => ApiError::Conflict(msg),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}
