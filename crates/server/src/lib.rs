// crates/server/src/lib.rs
//! Vault backup server library.
//!
//! Axum HTTP API for triggering, monitoring and cancelling backup jobs.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::{AppConfig, ConfigError};
pub use error::*;
pub use routes::api_routes;
pub use state::AppState;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use vault_backup_jobs::JobStore;

const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
const X_RESPONSE_TIME: HeaderName = HeaderName::from_static("x-response-time");
const X_API_VERSION: HeaderName = HeaderName::from_static("x-api-version");

/// Create the Axum application with all routes and middleware.
///
/// This sets up:
/// - Job API routes under `/api/v1`, system routes at the root
/// - CORS (allows any origin, exposes the request metadata headers)
/// - An `x-request-id` per request, kept if the client sent one
/// - `x-response-time` and `x-api-version` on every response
/// - Request tracing
pub fn create_app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([X_REQUEST_ID, X_RESPONSE_TIME]);

    Router::new()
        .merge(api_routes(state))
        .layer(middleware::from_fn(response_metadata))
        .layer(cors)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

/// Stamp the handling time and API version on the response. For SSE the
/// time covers the handler only, not the stream.
async fn response_metadata(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let mut response = next.run(request).await;

    let elapsed = format!("{:.3}s", started.elapsed().as_secs_f64());
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&elapsed) {
        headers.insert(X_RESPONSE_TIME, value);
    }
    headers.insert(X_API_VERSION, HeaderValue::from_static(env!("CARGO_PKG_VERSION")));
    response
}

/// Periodically delete jobs older than `max_age`, with their logs.
pub fn spawn_job_sweeper(store: JobStore, every: Duration, max_age: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(every).await;
            match store.sweep(max_age).await {
                Ok(0) => tracing::debug!("Job sweep: nothing to remove"),
                Ok(removed) => tracing::info!(removed, "Job sweep removed old jobs"),
                Err(e) => tracing::warn!(error = %e, "Job sweep failed"),
            }
        }
    })
}

// ============================================================================
// Integration Tests
// ============================================================================
