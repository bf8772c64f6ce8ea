// crates/server/src/state.rs
//! Application state for the Axum server.

use std::sync::Arc;
use std::time::{Duration, Instant};

use vault_backup_jobs::{JobController, JobStore, StepCommand, DEFAULT_POLL_INTERVAL};
use vault_backup_store::StateStore;

/// Shared application state accessible from all route handlers.
pub struct AppState {
    /// Server start time for uptime tracking.
    pub start_time: Instant,
    /// Token every `/api/v1` request must present.
    pub api_token: String,
    /// Starts, tracks and cancels backup runs; owns the job store.
    pub jobs: JobController,
    /// How often an SSE viewer polls its job.
    pub stream_poll_interval: Duration,
    /// Command whose success shows rclone is usable; its first output line
    /// is reported as the rclone version.
    pub rclone_version: StepCommand,
}

impl AppState {
    /// Create a new application state wrapped in an Arc for sharing.
    pub fn new(api_token: impl Into<String>, jobs: JobController) -> Arc<Self> {
        Self::with_settings(
            api_token,
            jobs,
            DEFAULT_POLL_INTERVAL,
            StepCommand::new("rclone").arg("version"),
        )
    }

    pub fn with_settings(
        api_token: impl Into<String>,
        jobs: JobController,
        stream_poll_interval: Duration,
        rclone_version: StepCommand,
    ) -> Arc<Self> {
        Arc::new(Self {
            start_time: Instant::now(),
            api_token: api_token.into(),
            jobs,
            stream_poll_interval,
            rclone_version,
        })
    }

    pub fn store(&self) -> &JobStore {
        self.jobs.store()
    }

    pub fn state_store(&self) -> &Arc<dyn StateStore> {
        self.jobs.store().state_store()
    }

    /// Get server uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
