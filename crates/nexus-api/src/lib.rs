//! Control-plane API for the Nexus workflow platform.
//!
//! A thin shell over the workflow service: project creation, workflow
//! control and status queries. All responses use the platform's JSON
//! envelope.

pub mod envelope;
pub mod error;
pub mod routes;
pub mod state;

pub use envelope::ApiResponse;
pub use error::ApiError;
pub use state::AppState;
