// crates/jobs/src/notifier.rs
//! Poll-driven event stream for a single job.
//!
//! Each viewer polls the store on its own interval, so a stream never holds
//! any state the controller has to know about.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::MissedTickBehavior;
use tokio_stream::Stream;

use crate::record::JobStore;
use crate::types::{JobId, JobStatus, LogEntry};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// One update pushed to a job viewer.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// Status or progress changed since the previous poll.
    Status {
        status: JobStatus,
        progress: u8,
        current_step: String,
        error: Option<String>,
    },
    /// A log line not yet sent to this viewer.
    Log(LogEntry),
    /// The job reached a terminal status. Always the last event.
    Done {
        status: JobStatus,
        result: Option<Value>,
        error: Option<String>,
    },
    /// The job vanished or could not be read. Ends the stream.
    Error { message: String },
}

impl JobEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Log(_) => "log",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    /// JSON body carried in the event's `data` field.
    pub fn payload(&self) -> Value {
        match self {
            Self::Status {
                status,
                progress,
                current_step,
                error,
            } => json!({
                "type": "status",
                "status": status,
                "progress": progress,
                "current_step": current_step,
                "error": error,
            }),
            Self::Log(entry) => json!({
                "type": "log",
                "timestamp": entry.timestamp,
                "level": entry.level,
                "message": entry.message,
            }),
            Self::Done { status, result, error } => json!({
                "type": "done",
                "status": status,
                "result": result,
                "error": error,
            }),
            Self::Error { message } => json!({ "error": message }),
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

/// Stream the life of `job_id`, polling `store` every `poll_interval`.
///
/// Per poll: a `Status` event when status or progress moved, then every log
/// line appended since the last poll, then `Done` if the job is terminal.
/// The stream ends after `Done` or `Error`.
pub fn job_events(
    store: JobStore,
    job_id: JobId,
    poll_interval: Duration,
) -> impl Stream<Item = JobEvent> + Send + 'static {
    async_stream::stream! {
        let mut ticker = tokio::time::interval(poll_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cursor = 0usize;
        let mut last_seen: Option<(JobStatus, u8)> = None;

        loop {
            ticker.tick().await;

            let job = match store.get(&job_id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    yield JobEvent::Error { message: "Job not found".to_string() };
                    break;
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "job stream read failed");
                    yield JobEvent::Error { message: e.to_string() };
                    break;
                }
            };

            if last_seen != Some((job.status, job.progress)) {
                last_seen = Some((job.status, job.progress));
                yield JobEvent::Status {
                    status: job.status,
                    progress: job.progress,
                    current_step: job.current_step.clone(),
                    error: job.error.clone(),
                };
            }

            match store.list_new_logs(&job_id, cursor).await {
                Ok((entries, next)) => {
                    cursor = next;
                    for entry in entries {
                        yield JobEvent::Log(entry);
                    }
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "job stream log read failed");
                    yield JobEvent::Error { message: e.to_string() };
                    break;
                }
            }

            if job.status.is_terminal() {
                yield JobEvent::Done {
                    status: job.status,
                    result: job.result,
                    error: job.error,
                };
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use futures_util::StreamExt;
    use pretty_assertions::assert_eq;
    use vault_backup_store::MemoryStore;

    use crate::types::{JobUpdate, LogLevel};

    fn store() -> JobStore {
        JobStore::new(Arc::new(MemoryStore::new()))
    }

    fn kinds(events: &[JobEvent]) -> Vec<&'static str> {
        events.iter().map(JobEvent::name).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_job_replays_and_ends() {
        let store = store();
        let job = store.create().await.unwrap();
        store.update(&job.id, JobUpdate::new().status(JobStatus::Running)).await.unwrap();
        store.append_log(&job.id, LogLevel::Info, "one").await.unwrap();
        store.append_log(&job.id, LogLevel::Success, "two").await.unwrap();
        store
            .update(
                &job.id,
                JobUpdate::new()
                    .status(JobStatus::Completed)
                    .progress(100)
                    .result(json!({ "exit_code": 0 })),
            )
            .await
            .unwrap();

        let events: Vec<JobEvent> = job_events(store, job.id.clone(), DEFAULT_POLL_INTERVAL)
            .collect()
            .await;

        assert_eq!(kinds(&events), vec!["status", "log", "log", "done"]);
        assert_eq!(
            events[3],
            JobEvent::Done {
                status: JobStatus::Completed,
                result: Some(json!({ "exit_code": 0 })),
                error: None,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_job_yields_single_error() {
        let events: Vec<JobEvent> = job_events(store(), "nope".into(), DEFAULT_POLL_INTERVAL)
            .collect()
            .await;
        assert_eq!(
            events,
            vec![JobEvent::Error {
                message: "Job not found".to_string()
            }]
        );
        assert_eq!(events[0].payload(), json!({ "error": "Job not found" }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_job_streams_in_order() {
        let store = store();
        let job = store.create().await.unwrap();

        let writer = {
            let store = store.clone();
            let id = job.id.clone();
            tokio::spawn(async move {
                let pause = Duration::from_millis(700);
                tokio::time::sleep(pause).await;
                store.update(&id, JobUpdate::new().status(JobStatus::Running).progress(10)).await.unwrap();
                store.append_log(&id, LogLevel::Info, "first").await.unwrap();
                tokio::time::sleep(pause).await;
                store.append_log(&id, LogLevel::Info, "second").await.unwrap();
                store.update(&id, JobUpdate::new().progress(50)).await.unwrap();
                tokio::time::sleep(pause).await;
                store.append_log(&id, LogLevel::Error, "third").await.unwrap();
                store
                    .update(&id, JobUpdate::new().status(JobStatus::Failed).error("exit 2"))
                    .await
                    .unwrap();
            })
        };

        let events: Vec<JobEvent> = job_events(store, job.id.clone(), DEFAULT_POLL_INTERVAL)
            .collect()
            .await;
        writer.await.unwrap();

        let logs: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                JobEvent::Log(entry) => Some(entry.message.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(logs, vec!["first", "second", "third"]);

        let statuses: Vec<(JobStatus, u8)> = events
            .iter()
            .filter_map(|e| match e {
                JobEvent::Status { status, progress, .. } => Some((*status, *progress)),
                _ => None,
            })
            .collect();
        assert_eq!(statuses.first(), Some(&(JobStatus::Pending, 0)));
        assert_eq!(statuses.last(), Some(&(JobStatus::Failed, 50)));
        assert!(statuses.windows(2).all(|w| w[0] != w[1]), "status repeated: {statuses:?}");

        let last = events.last().unwrap();
        assert_eq!(last.name(), "done");
        assert_eq!(last.payload()["error"], "exit 2");
        assert_eq!(events.iter().filter(|e| e.is_final()).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_viewers_see_same_logs() {
        let store = store();
        let job = store.create().await.unwrap();
        store.update(&job.id, JobUpdate::new().status(JobStatus::Running)).await.unwrap();
        for i in 0..5 {
            store.append_log(&job.id, LogLevel::Info, format!("line {i}")).await.unwrap();
        }
        store.update(&job.id, JobUpdate::new().status(JobStatus::Cancelled)).await.unwrap();

        let a = job_events(store.clone(), job.id.clone(), DEFAULT_POLL_INTERVAL).collect::<Vec<_>>();
        let b = job_events(store.clone(), job.id.clone(), DEFAULT_POLL_INTERVAL).collect::<Vec<_>>();
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a, b);
        assert_eq!(a.iter().filter(|e| e.name() == "log").count(), 5);
    }

    #[test]
    fn test_payload_shapes() {
        let status = JobEvent::Status {
            status: JobStatus::Running,
            progress: 45,
            current_step: "Logging into Bitwarden".into(),
            error: None,
        };
        assert_eq!(
            status.payload(),
            json!({
                "type": "status",
                "status": "running",
                "progress": 45,
                "current_step": "Logging into Bitwarden",
                "error": null,
            })
        );

        let log = JobEvent::Log(LogEntry {
            timestamp: chrono::Utc::now(),
            level: LogLevel::Warn,
            message: "careful".into(),
        });
        let payload = log.payload();
        assert_eq!(payload["type"], "log");
        assert_eq!(payload["level"], "WARN");
        assert_eq!(payload["message"], "careful");
        assert!(payload["timestamp"].is_string());
    }
}
