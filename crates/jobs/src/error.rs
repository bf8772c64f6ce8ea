// crates/jobs/src/error.rs
use thiserror::Error;
use vault_backup_store::StoreError;

/// Errors raised while recording or running backup jobs.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error("Corrupt job data: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Job not found: {0}")]
    NotFound(String),

    /// The run observed its cancellation token. Not a failure.
    #[error("Job cancelled")]
    Cancelled,
}

impl JobError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type JobResult<T> = Result<T, JobError>;
