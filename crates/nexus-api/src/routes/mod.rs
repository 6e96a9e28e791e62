//! Route definitions.

pub mod projects;
pub mod workflows;

use axum::Router;

use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/projects", projects::router())
        .merge(workflows::router())
        .with_state(state)
}
