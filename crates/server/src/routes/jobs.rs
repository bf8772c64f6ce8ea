// crates/server/src/routes/jobs.rs
//! API routes for backup jobs.
//!
//! - POST /jobs/trigger - Start a backup job in the background
//! - GET /jobs/ - List recent jobs, newest first
//! - GET /jobs/{id} - Job status record
//! - GET /jobs/{id}/logs - Paged job logs
//! - GET /jobs/{id}/stream - SSE stream of status, logs and completion
//! - POST /jobs/{id}/cancel - Cancel a pending or running job

use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use vault_backup_jobs::{job_events, JobId, JobRecord, JobStatus, LogEntry, LogLevel};

use super::{query_params, LISTING_CACHE_PATTERN};
use crate::auth::{RequireToken, StreamToken};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct TriggerResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobRecord>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct JobLogsResponse {
    pub job_id: JobId,
    pub logs: Vec<LogEntry>,
    pub total_logs: usize,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: JobId,
    pub status: &'static str,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LogParams {
    pub start: Option<i64>,
    pub limit: Option<i64>,
}

fn bounded(name: &str, value: Option<i64>, default: i64, min: i64, max: i64) -> ApiResult<i64> {
    let value = value.unwrap_or(default);
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(ApiError::BadRequest(format!("{name} must be between {min} and {max}")))
    }
}

/// POST /api/v1/jobs/trigger - Create a job and start it in the background.
async fn trigger_job(
    State(state): State<Arc<AppState>>,
    _: RequireToken,
) -> ApiResult<(StatusCode, Json<TriggerResponse>)> {
    match state.state_store().delete_matching(LISTING_CACHE_PATTERN).await {
        Ok(cleared) => tracing::debug!(cleared, "Cleared listing cache"),
        Err(e) => tracing::warn!(error = %e, "Failed to clear listing cache"),
    }

    let job = state.jobs.trigger().await?;
    Ok((
        StatusCode::CREATED,
        Json(TriggerResponse {
            job_id: job.id,
            status: job.status,
            message: "Backup job started. Use the job status endpoint to monitor progress.".to_string(),
            created_at: job.created_at,
        }),
    ))
}

/// GET /api/v1/jobs/ - Recent jobs, newest first.
async fn list_jobs(
    State(state): State<Arc<AppState>>,
    _: RequireToken,
    params: Result<Query<ListParams>, QueryRejection>,
) -> ApiResult<Json<JobListResponse>> {
    let params = query_params(params)?;
    let limit = bounded("limit", params.limit, 20, 1, 100)?;

    let jobs = state.store().list_recent(limit as usize).await?;
    Ok(Json(JobListResponse {
        total: jobs.len(),
        jobs,
    }))
}

/// GET /api/v1/jobs/{id} - Full status record.
async fn get_job(
    State(state): State<Arc<AppState>>,
    _: RequireToken,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobRecord>> {
    state
        .store()
        .get(&job_id)
        .await?
        .map(Json)
        .ok_or(ApiError::JobNotFound(job_id))
}

/// GET /api/v1/jobs/{id}/logs - `limit` entries starting at index `start`.
async fn get_job_logs(
    State(state): State<Arc<AppState>>,
    _: RequireToken,
    Path(job_id): Path<String>,
    params: Result<Query<LogParams>, QueryRejection>,
) -> ApiResult<Json<JobLogsResponse>> {
    let params = query_params(params)?;
    let start = bounded("start", params.start, 0, 0, i64::MAX / 2)?;
    let limit = bounded("limit", params.limit, 100, 1, 1000)?;

    if state.store().get(&job_id).await?.is_none() {
        return Err(ApiError::JobNotFound(job_id));
    }
    let logs = state.store().list_logs(&job_id, start, start + limit - 1).await?;
    Ok(Json(JobLogsResponse {
        job_id,
        total_logs: logs.len(),
        logs,
    }))
}

/// GET /api/v1/jobs/{id}/stream - SSE stream of job updates.
///
/// Emits `status`, `log`, `done` and `error` events and closes once the job
/// is finished.
async fn stream_job(
    State(state): State<Arc<AppState>>,
    _: StreamToken,
    Path(job_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if state.store().get(&job_id).await?.is_none() {
        return Err(ApiError::JobNotFound(job_id));
    }
    tracing::debug!(job_id = %job_id, "Job stream opened");

    let events = job_events(state.store().clone(), job_id, state.stream_poll_interval)
        .map(|event| Event::default().event(event.name()).json_data(event.payload()));

    let headers = [
        (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        (
            HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        ),
    ];
    Ok((headers, Sse::new(events)))
}

/// POST /api/v1/jobs/{id}/cancel - Cancel a pending or running job.
async fn cancel_job(
    State(state): State<Arc<AppState>>,
    _: RequireToken,
    Path(job_id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    let Some(job) = state.store().get(&job_id).await? else {
        return Err(ApiError::JobNotFound(job_id));
    };
    if !job.status.is_cancellable() {
        return Err(ApiError::BadRequest(format!(
            "Cannot cancel job with status '{}'",
            job.status
        )));
    }

    // Signal the task even for a pending job: it may start running before
    // the store write below lands.
    state.jobs.cancel_running(&job_id);
    if !state.store().cancel(&job_id).await? {
        // The run may have recorded its own cancellation first, or finished
        // between the read above and the write.
        let current = state.store().get(&job_id).await?.map(|j| j.status);
        if current != Some(JobStatus::Cancelled) {
            let status = current.map_or("unknown", JobStatus::as_str);
            return Err(ApiError::BadRequest(format!(
                "Cannot cancel job with status '{status}'"
            )));
        }
    }
    state
        .store()
        .append_log(&job_id, LogLevel::Warn, "Job cancelled by user")
        .await?;
    tracing::info!(job_id = %job_id, "Job cancelled by user");

    Ok(Json(CancelResponse {
        job_id,
        status: "ok",
        message: "Job cancelled successfully".to_string(),
    }))
}

/// Build the jobs router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/jobs/trigger", post(trigger_job))
        .route("/jobs", get(list_jobs))
        .route("/jobs/", get(list_jobs))
        .route("/jobs/{job_id}", get(get_job))
        .route("/jobs/{job_id}/logs", get(get_job_logs))
        .route("/jobs/{job_id}/stream", get(stream_job))
        .route("/jobs/{job_id}/cancel", post(cancel_job))
}
