// crates/server/src/routes/maintenance.rs
//! Maintenance endpoints.
//!
//! - POST /maintenance/cache/clear - Drop every cached rclone listing

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::LISTING_CACHE_PATTERN;
use crate::auth::RequireToken;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct CacheClearResponse {
    pub status: &'static str,
    pub message: String,
    /// Number of cache entries removed.
    pub cleared: u64,
    pub timestamp: DateTime<Utc>,
}

/// POST /maintenance/cache/clear - Remove cached listings.
///
/// Job records live in the same store and are left untouched.
async fn clear_cache(State(state): State<Arc<AppState>>, _: RequireToken) -> ApiResult<Json<CacheClearResponse>> {
    let cleared = state.state_store().delete_matching(LISTING_CACHE_PATTERN).await?;
    tracing::info!(cleared, "Listing cache cleared");

    Ok(Json(CacheClearResponse {
        status: "ok",
        message: "Cache cleared successfully".to_string(),
        cleared,
        timestamp: Utc::now(),
    }))
}

/// Build the maintenance router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/maintenance/cache/clear", post(clear_cache))
}
