// crates/jobs/src/lib.rs
//! Background backup job system.
//!
//! Provides:
//! - `JobStore`: TTL-bound job records, ordered logs, recency index
//! - `JobController`: spawns backup runs and tracks them for cancellation
//! - `job_events`: poll-driven event stream for one job (SSE-ready)
//! - `StepCommand` / `OutputStream`: external process plumbing

pub mod controller;
pub mod error;
pub mod notifier;
pub mod process;
pub mod progress;
pub mod record;
pub mod types;

pub use controller::{JobController, PipelineSteps};
pub use error::{JobError, JobResult};
pub use notifier::{job_events, JobEvent, DEFAULT_POLL_INTERVAL};
pub use process::{run_captured, CapturedOutput, OutputStream, StepCommand};
pub use record::{JobStore, JOB_TTL};
pub use types::{JobId, JobRecord, JobStatus, JobUpdate, LogEntry, LogLevel};
