//! Workflow creation, control and status endpoints.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use nexus_core::ResourceId;
use nexus_engine::service::{
    AgentUpdateRequest, ControlResult, CreatedProject, StageOutputView, ToolBuildRequest,
    WorkflowStatusView,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::AppState;
use crate::envelope::ApiResponse;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/workflows/agent-update", post(create_agent_update))
        .route("/workflows/tool-build", post(create_tool_build))
        .route("/workflow/{project_id}/pause", post(pause_workflow))
        .route("/workflow/{project_id}/resume", post(resume_workflow))
        .route("/workflow/{project_id}/stop", post(stop_workflow))
        .route("/workflow/{project_id}/restart", post(restart_workflow))
        .route("/workflow/{project_id}/status", get(workflow_status))
        .route(
            "/workflow/{project_id}/stages/{stage_name}/output",
            get(stage_output),
        )
}

async fn create_agent_update(
    State(state): State<AppState>,
    Json(request): Json<AgentUpdateRequest>,
) -> Result<Json<ApiResponse<CreatedProject>>, ApiError> {
    let created = state
        .workflow_service
        .create_agent_update_project(request)
        .await?;
    Ok(Json(ApiResponse::with_message(
        created,
        "agent update task queued",
    )))
}

async fn create_tool_build(
    State(state): State<AppState>,
    Json(request): Json<ToolBuildRequest>,
) -> Result<Json<ApiResponse<CreatedProject>>, ApiError> {
    let created = state
        .workflow_service
        .create_tool_build_project(request)
        .await?;
    Ok(Json(ApiResponse::with_message(
        created,
        "tool build task queued",
    )))
}

async fn pause_workflow(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> Result<Json<ApiResponse<ControlResult>>, ApiError> {
    let result = state
        .workflow_service
        .pause(ResourceId::from_uuid(project_id))
        .await?;
    Ok(Json(ApiResponse::ok(result)))
}

async fn resume_workflow(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> Result<Json<ApiResponse<ControlResult>>, ApiError> {
    let result = state
        .workflow_service
        .resume(ResourceId::from_uuid(project_id))
        .await?;
    Ok(Json(ApiResponse::ok(result)))
}

async fn stop_workflow(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> Result<Json<ApiResponse<ControlResult>>, ApiError> {
    let result = state
        .workflow_service
        .stop(ResourceId::from_uuid(project_id))
        .await?;
    Ok(Json(ApiResponse::ok(result)))
}

#[derive(Debug, Deserialize)]
struct RestartRequest {
    from_stage: String,
}

async fn restart_workflow(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Json(request): Json<RestartRequest>,
) -> Result<Json<ApiResponse<ControlResult>>, ApiError> {
    let result = state
        .workflow_service
        .restart_from_stage(ResourceId::from_uuid(project_id), &request.from_stage)
        .await?;
    Ok(Json(ApiResponse::ok(result)))
}

async fn workflow_status(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> Result<Json<ApiResponse<WorkflowStatusView>>, ApiError> {
    let status = state
        .workflow_service
        .get_workflow_status(ResourceId::from_uuid(project_id))
        .await?;
    Ok(Json(ApiResponse::ok(status)))
}

async fn stage_output(
    State(state): State<AppState>,
    Path((project_id, stage_name)): Path<(Uuid, String)>,
) -> Result<Json<ApiResponse<StageOutputView>>, ApiError> {
    let output = state
        .workflow_service
        .get_stage_output(ResourceId::from_uuid(project_id), &stage_name)
        .await?;
    Ok(Json(ApiResponse::ok(output)))
}
