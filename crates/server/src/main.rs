// crates/server/src/main.rs
//! Vault backup server binary.
//!
//! Reads configuration from the environment (and `.env`), picks the state
//! store, starts the periodic job sweep and serves the API.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use vault_backup_jobs::{JobController, JobStore};
use vault_backup_server::config::write_rclone_config;
use vault_backup_server::{create_app, spawn_job_sweeper, AppConfig, AppState};
use vault_backup_store::{MemoryStore, RedisStore, StateStore};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is the normal case in containers.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,vault_backup_server=info,vault_backup_jobs=info".into()),
        )
        .init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    let backend: Arc<dyn StateStore> = match &config.redis_url {
        Some(url) => {
            let store = RedisStore::connect(url)
                .await
                .with_context(|| format!("connecting to state store at {url}"))?;
            tracing::info!("Using Redis state store");
            Arc::new(store)
        }
        None => {
            tracing::warn!("REDIS_URL not set, job state is kept in memory and lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    // Held for the life of the process; dropping it deletes the file.
    let rclone_config = config
        .rclone_config_base64
        .as_deref()
        .map(write_rclone_config)
        .transpose()
        .context("writing rclone config")?;
    if let Some(file) = &rclone_config {
        tracing::info!(path = %file.path().display(), "Wrote rclone config from RCLONE_CONFIG_BASE64");
    }

    let store = JobStore::new(backend);
    let steps = config.pipeline_steps(rclone_config.as_ref().map(|f| f.path()));
    let controller = JobController::new(store.clone(), steps);
    let state = AppState::with_settings(
        config.api_token.clone(),
        controller,
        config.stream_poll_interval,
        config.rclone_version_command(),
    );

    let _sweeper = spawn_job_sweeper(store, config.cleanup_interval, config.job_max_age);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("Vault backup API listening on {addr}");

    axum::serve(listener, create_app(state))
        .await
        .context("server error")?;
    Ok(())
}
