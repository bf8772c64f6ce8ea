// crates/server/src/routes/health.rs
//! System endpoints: health, ping, detailed status and version info.
//!
//! Two components are checked: a state store ping and `rclone version`. A
//! component that cannot be reached is `unavailable` and degrades the
//! service. One that answers with a failure is `error` and makes it
//! unhealthy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use vault_backup_jobs::{run_captured, JobError, StepCommand};

use super::query_params;
use crate::error::ApiResult;
use crate::state::AppState;

/// Upper bound on a single component check.
const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

const X_HEALTH_STATUS: HeaderName = HeaderName::from_static("x-health-status");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Ok,
    Error,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl OverallStatus {
    /// Any `error` wins over any `unavailable`.
    pub fn from_components(components: &[ComponentStatus]) -> Self {
        if components.contains(&ComponentStatus::Error) {
            OverallStatus::Unhealthy
        } else if components.contains(&ComponentStatus::Unavailable) {
            OverallStatus::Degraded
        } else {
            OverallStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ComponentCheck {
    pub status: ComponentStatus,
    pub response_time_ms: f64,
}

struct RcloneCheck {
    check: ComponentCheck,
    /// First line of `rclone version` output when it names rclone.
    version: Option<String>,
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

async fn check_store(state: &AppState) -> ComponentCheck {
    let started = Instant::now();
    let status = match tokio::time::timeout(CHECK_TIMEOUT, state.state_store().ping()).await {
        Ok(Ok(())) => ComponentStatus::Ok,
        Ok(Err(e)) if e.is_unavailable() => {
            tracing::warn!(error = %e, "State store unreachable");
            ComponentStatus::Unavailable
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "State store ping failed");
            ComponentStatus::Error
        }
        Err(_) => {
            tracing::warn!("State store ping timed out");
            ComponentStatus::Unavailable
        }
    };
    ComponentCheck {
        status,
        response_time_ms: elapsed_ms(started),
    }
}

async fn check_rclone(cmd: &StepCommand) -> RcloneCheck {
    let started = Instant::now();
    let cancel = CancellationToken::new();
    let deadline = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(CHECK_TIMEOUT).await;
            cancel.cancel();
        })
    };
    let outcome = run_captured(cmd, &cancel).await;
    deadline.abort();

    let (status, version) = match outcome {
        Ok(out) if out.success() => (ComponentStatus::Ok, version_line(&out.stdout)),
        Ok(out) => {
            tracing::warn!(exit_code = ?out.exit_code, stderr = %out.stderr.trim(), "rclone version failed");
            (ComponentStatus::Error, None)
        }
        Err(JobError::Spawn { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            (ComponentStatus::Unavailable, None)
        }
        Err(e) => {
            tracing::warn!(error = %e, "rclone check failed");
            (ComponentStatus::Error, None)
        }
    };
    RcloneCheck {
        check: ComponentCheck {
            status,
            response_time_ms: elapsed_ms(started),
        },
        version,
    }
}

fn version_line(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .next()
        .map(str::trim)
        .filter(|line| line.to_lowercase().contains("rclone"))
        .map(str::to_string)
}

/// Response for the health check endpoint.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct HealthResponse {
    pub status: OverallStatus,
    pub version: String,
    pub uptime_secs: u64,
    pub store: ComponentStatus,
    pub rclone: ComponentStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct PingResponse {
    pub status: &'static str,
    pub message: &'static str,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct StatusParams {
    #[serde(default, alias = "include_redis")]
    pub include_store: bool,
    #[serde(default)]
    pub include_rclone: bool,
}

#[derive(Debug, Serialize)]
pub struct ComponentReport {
    pub status: ComponentStatus,
    pub response_time_ms: f64,
    pub healthy: bool,
}

impl From<ComponentCheck> for ComponentReport {
    fn from(check: ComponentCheck) -> Self {
        Self {
            status: check.status,
            response_time_ms: check.response_time_ms,
            healthy: check.status == ComponentStatus::Ok,
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct StatusComponents {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<ComponentReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rclone: Option<ComponentReport>,
}

#[derive(Debug, Serialize)]
pub struct SystemInfo {
    pub version: &'static str,
    pub running_jobs: usize,
    pub stream_poll_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub overall_status: OverallStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    pub components: StatusComponents,
    pub system: SystemInfo,
}

#[derive(Debug, Serialize)]
pub struct ApiInfo {
    pub name: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct RcloneInfo {
    /// Version banner, `"unknown"` when rclone ran but printed none, or
    /// `"error"` when it could not be run successfully.
    pub version: String,
    pub available: bool,
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub api: ApiInfo,
    pub server_time: DateTime<Utc>,
    pub rclone: RcloneInfo,
}

/// GET /health - Health check endpoint.
///
/// 200 when healthy, 200 with `X-Health-Status: degraded` when a component is
/// unreachable, 503 when a component reports an error.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    let (store, rclone) = tokio::join!(check_store(&state), check_rclone(&state.rclone_version));
    let status = OverallStatus::from_components(&[store.status, rclone.check.status]);

    let body = Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.uptime_secs(),
        store: store.status,
        rclone: rclone.check.status,
        timestamp: Utc::now(),
    });
    match status {
        OverallStatus::Healthy => (StatusCode::OK, body).into_response(),
        OverallStatus::Degraded => (
            StatusCode::OK,
            [(X_HEALTH_STATUS, HeaderValue::from_static("degraded"))],
            body,
        )
            .into_response(),
        OverallStatus::Unhealthy => (StatusCode::SERVICE_UNAVAILABLE, body).into_response(),
    }
}

/// GET /ping - Connectivity check.
pub async fn ping() -> Json<PingResponse> {
    Json(PingResponse {
        status: "ok",
        message: "pong",
        timestamp: Utc::now(),
    })
}

/// GET /status - Overall status, plus per-component timings on request.
///
/// Both components always feed `overall_status`; the `include_*` flags only
/// control which reports are returned.
pub async fn detailed_status(
    State(state): State<Arc<AppState>>,
    params: Result<Query<StatusParams>, QueryRejection>,
) -> ApiResult<Json<StatusResponse>> {
    let params = query_params(params)?;
    let (store, rclone) = tokio::join!(check_store(&state), check_rclone(&state.rclone_version));

    Ok(Json(StatusResponse {
        overall_status: OverallStatus::from_components(&[store.status, rclone.check.status]),
        timestamp: Utc::now(),
        uptime_secs: state.uptime_secs(),
        components: StatusComponents {
            store: params.include_store.then(|| store.into()),
            rclone: params.include_rclone.then(|| rclone.check.into()),
        },
        system: SystemInfo {
            version: env!("CARGO_PKG_VERSION"),
            running_jobs: state.jobs.running_count(),
            stream_poll_ms: u64::try_from(state.stream_poll_interval.as_millis()).unwrap_or(u64::MAX),
        },
    }))
}

/// GET /version - API and rclone versions.
pub async fn version_info(State(state): State<Arc<AppState>>) -> Json<VersionResponse> {
    let rclone = check_rclone(&state.rclone_version).await;
    let (version, available) = match (rclone.check.status, rclone.version) {
        (ComponentStatus::Ok, Some(version)) => (version, true),
        (ComponentStatus::Ok, None) => ("unknown".to_string(), false),
        _ => ("error".to_string(), false),
    };

    Json(VersionResponse {
        api: ApiInfo {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
        },
        server_time: Utc::now(),
        rclone: RcloneInfo { version, available },
    })
}

/// Create the system routes router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/ping", get(ping))
        .route("/status", get(detailed_status))
        .route("/version", get(version_info))
}
