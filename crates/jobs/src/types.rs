// crates/jobs/src/types.rs
//! Types for the background job system.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a backup job (UUID v4, hyphenated).
pub type JobId = String;

/// Status of a backup job.
///
/// ```text
/// Pending ──► Running ──► Completed | Failed | Cancelled
///    └──────────────────► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a job in this status may still be cancelled.
    pub fn is_cancellable(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Whether `self -> next` is an edge of the job state machine.
    pub fn can_transition_to(self, next: Self) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Cancelled) | (Running, Completed) | (Running, Failed) | (Running, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a job log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Success,
    Debug,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Success => "SUCCESS",
            Self::Debug => "DEBUG",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted state of one backup job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: u8,
    pub current_step: String,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl JobRecord {
    /// Fresh record in `Pending`.
    pub fn pending(id: JobId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            created_at,
            started_at: None,
            completed_at: None,
            progress: 0,
            current_step: "Initializing...".to_string(),
            error: None,
            result: None,
        }
    }

    /// Apply a partial update at time `now`.
    ///
    /// The whole update is dropped, and false returned, when its status is not
    /// an edge of the state machine, or when the record is already terminal and
    /// the update does not re-assert that same status.
    pub fn apply(&mut self, update: JobUpdate, now: DateTime<Utc>) -> bool {
        match update.status {
            Some(next) if next == self.status => {}
            Some(next) if self.status.can_transition_to(next) => {
                self.status = next;
                if next == JobStatus::Running && self.started_at.is_none() {
                    self.started_at = Some(now);
                }
                if next.is_terminal() && self.completed_at.is_none() {
                    self.completed_at = Some(now);
                }
            }
            Some(_) => return false,
            None if self.status.is_terminal() => return false,
            None => {}
        }
        if let Some(progress) = update.progress {
            self.progress = progress.min(100);
        }
        if let Some(step) = update.current_step {
            self.current_step = step;
        }
        if let Some(error) = update.error {
            self.error = Some(error);
        }
        if let Some(result) = update.result {
            self.result = Some(result);
        }
        true
    }
}

/// Partial update of a `JobRecord`; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub current_step: Option<String>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }
}

/// One line of a job's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn test_transition_table() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Pending));
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_string(&JobStatus::Cancelled).unwrap(), "\"cancelled\"");
        assert_eq!(serde_json::to_string(&LogLevel::Success).unwrap(), "\"SUCCESS\"");
        let parsed: JobStatus = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(parsed, JobStatus::Running);
    }

    #[test]
    fn test_apply_sets_timestamps_once() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(5);
        let t2 = t0 + chrono::Duration::seconds(10);
        let mut job = JobRecord::pending("j".into(), t0);

        assert!(job.apply(JobUpdate::new().status(JobStatus::Running), t1));
        assert_eq!(job.started_at, Some(t1));
        assert_eq!(job.completed_at, None);

        // Re-asserting Running keeps the original start time.
        assert!(job.apply(JobUpdate::new().status(JobStatus::Running).progress(40), t2));
        assert_eq!(job.started_at, Some(t1));
        assert_eq!(job.progress, 40);

        assert!(job.apply(JobUpdate::new().status(JobStatus::Failed).error("boom"), t2));
        assert_eq!(job.completed_at, Some(t2));
        assert_eq!(job.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_apply_rejects_leaving_terminal_state() {
        let t0 = Utc::now();
        let mut job = JobRecord::pending("j".into(), t0);
        job.apply(JobUpdate::new().status(JobStatus::Cancelled), t0);
        let before = job.clone();

        let later = t0 + chrono::Duration::seconds(1);
        let accepted = job.apply(
            JobUpdate::new()
                .status(JobStatus::Completed)
                .progress(100)
                .result(serde_json::json!({"exit_code": 0})),
            later,
        );
        assert!(!accepted);
        assert_eq!(job, before);

        // Progress-only writes cannot touch a finished job either.
        assert!(!job.apply(JobUpdate::new().progress(50), later));
        assert_eq!(job, before);

        // Re-asserting the terminal status may still relabel the step.
        assert!(job.apply(JobUpdate::new().status(JobStatus::Cancelled).step("Job cancelled"), later));
        assert_eq!(job.current_step, "Job cancelled");
        assert_eq!(job.completed_at, before.completed_at);
    }

    #[test]
    fn test_apply_rejects_skipping_running() {
        let mut job = JobRecord::pending("j".into(), Utc::now());
        assert!(!job.apply(JobUpdate::new().status(JobStatus::Completed).progress(100), Utc::now()));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
    }

    #[test]
    fn test_apply_clamps_progress() {
        let mut job = JobRecord::pending("j".into(), Utc::now());
        job.apply(JobUpdate::new().progress(250), Utc::now());
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn test_record_json_shape() {
        let job = JobRecord::pending("abc".into(), Utc::now());
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["id"], "abc");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["progress"], 0);
        assert_eq!(json["current_step"], "Initializing...");
        assert!(json["started_at"].is_null());
        assert!(json["result"].is_null());
    }
}
