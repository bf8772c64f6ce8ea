// crates/server/src/routes/mod.rs
//! API route handlers for the vault backup server.

pub mod health;
pub mod jobs;
pub mod maintenance;

use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::Query;
use axum::Router;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Listing cache entries written by the rclone wrapper.
pub const LISTING_CACHE_PATTERN: &str = "rclone_lsjson:*";

/// Turn a query rejection into a 400 with the usual JSON error body.
pub(crate) fn query_params<T>(params: Result<Query<T>, QueryRejection>) -> ApiResult<T> {
    params
        .map(|Query(p)| p)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

/// Create the combined router.
///
/// Routes:
/// - GET  /health - Health check including the state store and rclone
/// - GET  /ping - Connectivity check
/// - GET  /status - Overall status with optional component metrics
/// - GET  /version - API and rclone versions
/// - POST /maintenance/cache/clear - Drop cached rclone listings
/// - POST /api/v1/jobs/trigger - Start a backup job
/// - GET  /api/v1/jobs/ - List recent jobs
/// - GET  /api/v1/jobs/{id} - Job status
/// - GET  /api/v1/jobs/{id}/logs - Paged job logs
/// - GET  /api/v1/jobs/{id}/stream - SSE stream of job updates
/// - POST /api/v1/jobs/{id}/cancel - Cancel a pending or running job
pub fn api_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(health::router())
        .merge(maintenance::router())
        .nest("/api/v1", jobs::router())
        .with_state(state)
}
