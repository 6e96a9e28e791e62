//! Project creation endpoints.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use nexus_engine::service::{CreateProjectRequest, CreatedProject};

use crate::AppState;
use crate::envelope::ApiResponse;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/", post(create_project))
}

async fn create_project(
    State(state): State<AppState>,
    Json(request): Json<CreateProjectRequest>,
) -> Result<Json<ApiResponse<CreatedProject>>, ApiError> {
    let created = state
        .workflow_service
        .create_build_project(request)
        .await?;
    Ok(Json(ApiResponse::with_message(
        created,
        "project created, build task queued",
    )))
}
