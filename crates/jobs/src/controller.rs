// crates/jobs/src/controller.rs
//! Backup job lifecycle: spawn the pipeline, record progress, honour cancel.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::{JobError, JobResult};
use crate::process::{self, OutputStream, StepCommand};
use crate::progress::{classify_line, match_milestone};
use crate::record::JobStore;
use crate::types::{JobId, JobRecord, JobStatus, JobUpdate, LogLevel};

/// The two external steps of a backup run.
#[derive(Debug, Clone)]
pub struct PipelineSteps {
    /// Writes the rclone configuration. Output is captured, not streamed.
    pub setup: StepCommand,
    /// The backup script. Output is streamed line by line.
    pub backup: StepCommand,
}

/// Outcome of the setup step.
enum Setup {
    Ready,
    Failed(JobStatus),
}

/// Starts backup runs in the background and tracks the live ones.
///
/// Cheap to clone; clones share the registry of running jobs.
#[derive(Clone)]
pub struct JobController {
    store: JobStore,
    steps: Arc<PipelineSteps>,
    running: Arc<DashMap<JobId, CancellationToken>>,
}

/// Removes a job from the registry when its task ends, however it ends.
struct RunningGuard {
    running: Arc<DashMap<JobId, CancellationToken>>,
    job_id: JobId,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.remove(&self.job_id);
    }
}

impl JobController {
    pub fn new(store: JobStore, steps: PipelineSteps) -> Self {
        Self {
            store,
            steps: Arc::new(steps),
            running: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Create a job and start running it in the background.
    ///
    /// Returns the freshly created record (still `Pending`); the caller does
    /// not wait for any part of the run.
    pub async fn trigger(&self) -> JobResult<JobRecord> {
        let job = self.store.create().await?;
        self.start(&job.id);
        tracing::info!(job_id = %job.id, "backup job triggered");
        Ok(job)
    }

    /// Spawn the run for an existing job and register it for cancellation.
    pub fn start(&self, job_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.running.insert(job_id.to_string(), token.clone());

        let controller = self.clone();
        let job_id = job_id.to_string();
        let run_token = token.clone();
        tokio::spawn(async move {
            let _guard = RunningGuard {
                running: controller.running.clone(),
                job_id: job_id.clone(),
            };
            match controller.run(&job_id, run_token).await {
                Ok(status) => tracing::info!(job_id = %job_id, %status, "backup job finished"),
                Err(JobError::Cancelled) => tracing::info!(job_id = %job_id, "backup job cancelled"),
                Err(e) => tracing::error!(job_id = %job_id, error = %e, "backup job aborted"),
            }
        });
        token
    }

    /// Signal the live run of `job_id` to stop. True while the run is still
    /// registered, including when it was already signalled.
    pub fn cancel_running(&self, job_id: &str) -> bool {
        let Some(token) = self.running.get(job_id) else {
            return false;
        };
        if !token.is_cancelled() {
            token.cancel();
            tracing::info!(job_id, "cancellation requested");
        }
        true
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.running.contains_key(job_id)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Drive one job from `Pending` to a terminal status.
    ///
    /// Returns the status the record ended in, or `JobError::Cancelled` when
    /// `cancel` fired mid-run. A job that is no longer pending is left alone.
    pub async fn run(&self, job_id: &str, cancel: CancellationToken) -> JobResult<JobStatus> {
        let job = self
            .set(
                job_id,
                JobUpdate::new()
                    .status(JobStatus::Running)
                    .progress(0)
                    .step("Starting backup process..."),
            )
            .await?;
        if job.status != JobStatus::Running {
            tracing::info!(job_id, status = %job.status, "job is not pending, skipping run");
            return Ok(job.status);
        }

        match self.execute(job_id, &cancel).await {
            Ok(status) => Ok(status),
            Err(JobError::Cancelled) => {
                self.finish(
                    job_id,
                    LogLevel::Warn,
                    "Backup job was cancelled".to_string(),
                    JobUpdate::new().status(JobStatus::Cancelled).step("Job cancelled"),
                )
                .await;
                Err(JobError::Cancelled)
            }
            Err(e) => {
                let message = e.to_string();
                tracing::error!(job_id, error = %message, "backup job failed unexpectedly");
                let status = self
                    .finish(
                        job_id,
                        LogLevel::Error,
                        format!("Unexpected error: {message}"),
                        JobUpdate::new()
                            .status(JobStatus::Failed)
                            .error(message)
                            .step("Unexpected error"),
                    )
                    .await;
                Ok(status.unwrap_or(JobStatus::Failed))
            }
        }
    }

    async fn execute(&self, job_id: &str, cancel: &CancellationToken) -> JobResult<JobStatus> {
        self.store.append_log(job_id, LogLevel::Info, "Backup job started").await?;
        if let Setup::Failed(status) = self.run_setup(job_id, cancel).await? {
            return Ok(status);
        }
        self.run_backup(job_id, cancel).await
    }

    async fn run_setup(&self, job_id: &str, cancel: &CancellationToken) -> JobResult<Setup> {
        self.set(job_id, JobUpdate::new().progress(10).step("Setting up rclone configuration..."))
            .await?;
        self.store.append_log(job_id, LogLevel::Info, "Running setup step").await?;

        let output = process::run_captured(&self.steps.setup, cancel).await?;
        for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
            self.store
                .append_log(job_id, LogLevel::Info, format!("[setup] {}", line.trim_end()))
                .await?;
        }

        if !output.success() {
            let stderr = output.stderr.trim();
            let error = if stderr.is_empty() { "Setup failed" } else { stderr };
            tracing::warn!(job_id, exit_code = ?output.exit_code, "setup step failed");
            self.store
                .append_log(job_id, LogLevel::Error, format!("Setup failed: {error}"))
                .await?;
            let job = self
                .set(
                    job_id,
                    JobUpdate::new().status(JobStatus::Failed).error(error).step("Setup failed"),
                )
                .await?;
            return Ok(Setup::Failed(job.status));
        }

        self.store.append_log(job_id, LogLevel::Success, "Rclone setup completed").await?;
        self.set(job_id, JobUpdate::new().progress(20).step("Running backup script..."))
            .await?;
        Ok(Setup::Ready)
    }

    async fn run_backup(&self, job_id: &str, cancel: &CancellationToken) -> JobResult<JobStatus> {
        self.store.append_log(job_id, LogLevel::Info, "Starting backup script").await?;
        let mut output = OutputStream::spawn(&self.steps.backup)?;

        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    output.kill().await;
                    return Err(JobError::Cancelled);
                }
                line = output.next_line() => line,
            };
            let Some(line) = line else { break };
            self.record_line(job_id, &line).await?;
        }

        let exit_code = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                output.kill().await;
                return Err(JobError::Cancelled);
            }
            code = output.wait() => code?,
        };

        let job = match exit_code {
            Some(0) => {
                self.store
                    .append_log(job_id, LogLevel::Success, "Backup job completed successfully")
                    .await?;
                self.set(
                    job_id,
                    JobUpdate::new()
                        .status(JobStatus::Completed)
                        .progress(100)
                        .step("Backup completed successfully")
                        .result(json!({ "exit_code": 0 })),
                )
                .await?
            }
            code => {
                let error = match code {
                    Some(code) => format!("Backup script exited with code {code}"),
                    None => "Backup script terminated by signal".to_string(),
                };
                tracing::warn!(job_id, exit_code = ?code, "backup script failed");
                self.store.append_log(job_id, LogLevel::Error, error.as_str()).await?;
                self.set(
                    job_id,
                    JobUpdate::new().status(JobStatus::Failed).error(error).step("Backup failed"),
                )
                .await?
            }
        };
        Ok(job.status)
    }

    /// Log one script output line and advance progress on a milestone.
    async fn record_line(&self, job_id: &str, line: &str) -> JobResult<()> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }
        self.store.append_log(job_id, classify_line(line), line).await?;
        if let Some((keyword, progress)) = match_milestone(line) {
            tracing::debug!(job_id, progress, "backup milestone reached");
            self.set(job_id, JobUpdate::new().progress(progress).step(keyword))
                .await?;
        }
        Ok(())
    }

    async fn set(&self, job_id: &str, update: JobUpdate) -> JobResult<JobRecord> {
        self.store
            .update(job_id, update)
            .await?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    /// Best-effort terminal write. The log line goes first so a viewer that
    /// sees the terminal status has already been able to read it.
    async fn finish(
        &self,
        job_id: &str,
        level: LogLevel,
        message: String,
        update: JobUpdate,
    ) -> Option<JobStatus> {
        if let Err(e) = self.store.append_log(job_id, level, message).await {
            tracing::error!(job_id, error = %e, "failed to record final log line");
        }
        match self.set(job_id, update).await {
            Ok(job) => Some(job.status),
            Err(e) => {
                tracing::error!(job_id, error = %e, "failed to record final job status");
                None
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use vault_backup_store::MemoryStore;

    fn sh(script: &str) -> StepCommand {
        StepCommand::new("sh").arg("-c").arg(script)
    }

    fn controller(setup: &str, backup: &str) -> JobController {
        let store = JobStore::new(Arc::new(MemoryStore::new()));
        JobController::new(
            store,
            PipelineSteps {
                setup: sh(setup),
                backup: sh(backup),
            },
        )
    }

    async fn wait_for(store: &JobStore, id: &str, done: impl Fn(&JobRecord) -> bool) -> JobRecord {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let job = store.get(id).await.unwrap().expect("job exists");
            if done(&job) {
                return job;
            }
            assert!(tokio::time::Instant::now() < deadline, "timed out, last state: {job:?}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn messages(store: &JobStore, id: &str) -> Vec<String> {
        store
            .list_logs(id, 0, -1)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.message)
            .collect()
    }

    #[tokio::test]
    async fn test_run_completes() {
        let c = controller(
            "echo configured",
            "echo 'Unlocking vault'; echo '[WARN] slow remote'; echo 'Backup completed successfully'",
        );
        let job = c.store().create().await.unwrap();

        let status = c.run(&job.id, CancellationToken::new()).await.unwrap();
        assert_eq!(status, JobStatus::Completed);

        let job = c.store().get(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.current_step, "Backup completed successfully");
        assert_eq!(job.result, Some(json!({ "exit_code": 0 })));
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_some());

        let logs = c.store().list_logs(&job.id, 0, -1).await.unwrap();
        let text: Vec<&str> = logs.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(text[0], "Backup job started");
        assert!(text.contains(&"[setup] configured"));
        assert!(text.contains(&"Rclone setup completed"));
        let warn = logs.iter().find(|e| e.message == "[WARN] slow remote").unwrap();
        assert_eq!(warn.level, LogLevel::Warn);
        let last = logs.last().unwrap();
        assert_eq!(last.level, LogLevel::Success);
        assert_eq!(last.message, "Backup job completed successfully");
    }

    #[tokio::test]
    async fn test_milestone_progress_then_cancel() {
        let c = controller("true", "echo '[INFO] Unlocking vault...'; sleep 30");
        let job = c.trigger().await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let mid = wait_for(c.store(), &job.id, |j| j.progress == 50).await;
        assert_eq!(mid.status, JobStatus::Running);
        assert_eq!(mid.current_step, "Unlocking vault");

        assert!(c.cancel_running(&job.id));
        // Still registered until the run unwinds, so a repeat is accepted.
        assert!(c.cancel_running(&job.id));
        let done = wait_for(c.store(), &job.id, |j| j.status.is_terminal()).await;
        assert_eq!(done.status, JobStatus::Cancelled);
        assert_eq!(done.current_step, "Job cancelled");
        assert!(messages(c.store(), &job.id)
            .await
            .contains(&"Backup job was cancelled".to_string()));
    }

    #[tokio::test]
    async fn test_setup_failure_skips_backup() {
        let c = controller("echo 'bad config' >&2; exit 3", "echo backup-ran");
        let job = c.store().create().await.unwrap();

        let status = c.run(&job.id, CancellationToken::new()).await.unwrap();
        assert_eq!(status, JobStatus::Failed);

        let job = c.store().get(&job.id).await.unwrap().unwrap();
        assert_eq!(job.error.as_deref(), Some("bad config"));
        assert_eq!(job.current_step, "Setup failed");
        let text = messages(c.store(), &job.id).await;
        assert!(text.contains(&"Setup failed: bad config".to_string()));
        assert!(!text.iter().any(|m| m.contains("backup-ran")));
        assert!(!text.contains(&"Starting backup script".to_string()));
    }

    #[tokio::test]
    async fn test_setup_failure_without_stderr() {
        let c = controller("exit 1", "true");
        let job = c.store().create().await.unwrap();
        c.run(&job.id, CancellationToken::new()).await.unwrap();

        let job = c.store().get(&job.id).await.unwrap().unwrap();
        assert_eq!(job.error.as_deref(), Some("Setup failed"));
    }

    #[tokio::test]
    async fn test_backup_nonzero_exit() {
        let c = controller("true", "echo '[ERROR] upload failed'; exit 2");
        let job = c.store().create().await.unwrap();

        let status = c.run(&job.id, CancellationToken::new()).await.unwrap();
        assert_eq!(status, JobStatus::Failed);

        let job = c.store().get(&job.id).await.unwrap().unwrap();
        assert_eq!(job.error.as_deref(), Some("Backup script exited with code 2"));
        assert_eq!(job.current_step, "Backup failed");
        let logs = c.store().list_logs(&job.id, 0, -1).await.unwrap();
        let upload = logs.iter().find(|e| e.message == "[ERROR] upload failed").unwrap();
        assert_eq!(upload.level, LogLevel::Error);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_unexpected_error() {
        let store = JobStore::new(Arc::new(MemoryStore::new()));
        let c = JobController::new(
            store,
            PipelineSteps {
                setup: sh("true"),
                backup: StepCommand::new("/nonexistent/backup.sh"),
            },
        );
        let job = c.store().create().await.unwrap();

        let status = c.run(&job.id, CancellationToken::new()).await.unwrap();
        assert_eq!(status, JobStatus::Failed);

        let job = c.store().get(&job.id).await.unwrap().unwrap();
        assert_eq!(job.current_step, "Unexpected error");
        assert!(job.error.unwrap().contains("/nonexistent/backup.sh"));
        let last = c.store().list_logs(&job.id, -1, -1).await.unwrap();
        assert!(last[0].message.starts_with("Unexpected error: "));
    }

    #[tokio::test]
    async fn test_cancel_during_setup() {
        let c = controller("sleep 30", "echo backup-ran");
        let job = c.store().create().await.unwrap();
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = c.run(&job.id, token).await.unwrap_err();
        assert!(err.is_cancelled());

        let job = c.store().get(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(!messages(c.store(), &job.id)
            .await
            .iter()
            .any(|m| m.contains("backup-ran")));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_is_left_alone() {
        let c = controller("echo setup-ran", "echo backup-ran");
        let job = c.store().create().await.unwrap();
        assert!(c.store().cancel(&job.id).await.unwrap());

        let status = c.run(&job.id, CancellationToken::new()).await.unwrap();
        assert_eq!(status, JobStatus::Cancelled);

        let job = c.store().get(&job.id).await.unwrap().unwrap();
        assert_eq!(job.started_at, None);
        assert!(messages(c.store(), &job.id).await.is_empty());
    }

    #[tokio::test]
    async fn test_run_missing_job() {
        let c = controller("true", "true");
        let err = c.run("missing", CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, JobError::NotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_registry_cleared_after_run() {
        let c = controller("true", "echo done");
        assert!(!c.cancel_running("nope"));

        let job = c.trigger().await.unwrap();
        wait_for(c.store(), &job.id, |j| j.status.is_terminal()).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while c.is_running(&job.id) {
            assert!(tokio::time::Instant::now() < deadline, "registry entry never removed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(c.running_count(), 0);
        assert!(!c.cancel_running(&job.id));
    }
}
