//! Job handles
//!
//! [`Job`] is the consumer side held by whoever waits for the job;
//! [`JobUpdater`] is the producer side driven by the notification stream.

use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tnascert_proto::{JobEvent, JobState};
use tokio::sync::mpsc;

/// Observer invoked by the producer for every progress or state change
///
/// Arguments are the progress percentage, the job state and the server's
/// description of the current step.
pub type ProgressCallback = Arc<dyn Fn(f64, &JobState, &str) + Send + Sync>;

/// Reason reported when the server fails a job without giving one
const UNSPECIFIED_FAILURE: &str = "job failed";

/// Point-in-time view of a job
#[derive(Debug, Clone, Default)]
pub struct JobStatus {
    pub state: JobState,
    /// Progress percentage in `[0, 100]`
    pub progress: f64,
    pub description: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Authoritative terminal flag, independent of `state`
    pub finished: bool,
}

/// Handle to one in-flight server-side job
pub struct Job {
    pub(crate) id: i64,
    pub(crate) method: String,
    pub(crate) status: Arc<Mutex<JobStatus>>,
    pub(crate) progress_rx: mpsc::UnboundedReceiver<f64>,
    pub(crate) done_rx: mpsc::Receiver<String>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("status", &self.status())
            .finish()
    }
}

impl Job {
    /// Create a job handle and its producer
    pub fn channel(id: i64, method: impl Into<String>) -> (Job, JobUpdater) {
        let method = method.into();
        let status = Arc::new(Mutex::new(JobStatus::default()));
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        // Exactly one terminal message is ever sent
        let (done_tx, done_rx) = mpsc::channel(1);

        let job = Job {
            id,
            method: method.clone(),
            status: status.clone(),
            progress_rx,
            done_rx,
        };

        let updater = JobUpdater {
            id,
            method,
            status,
            progress_tx: Some(progress_tx),
            done_tx: Some(done_tx),
            callback: None,
        };

        (job, updater)
    }

    /// Server-assigned job id (0 when the server did not report one)
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Non-blocking snapshot of the job's current state
    pub fn status(&self) -> JobStatus {
        lock(&self.status).clone()
    }

    pub fn is_finished(&self) -> bool {
        lock(&self.status).finished
    }
}

/// Producer side of a [`Job`]
///
/// Dropping the updater closes both channels. A job whose updater is
/// dropped before a terminal update is observed as abandoned.
pub struct JobUpdater {
    id: i64,
    method: String,
    status: Arc<Mutex<JobStatus>>,
    progress_tx: Option<mpsc::UnboundedSender<f64>>,
    done_tx: Option<mpsc::Sender<String>>,
    callback: Option<ProgressCallback>,
}

impl fmt::Debug for JobUpdater {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobUpdater")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl JobUpdater {
    /// Attach an observer called on every update
    pub fn with_callback(mut self, callback: Option<ProgressCallback>) -> Self {
        self.callback = callback;
        self
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Whether a terminal update has been delivered
    pub fn is_finished(&self) -> bool {
        self.done_tx.is_none()
    }

    /// Apply one notification from the jobs collection
    pub fn apply(&mut self, event: &JobEvent) {
        if self.is_finished() {
            return;
        }

        if let Some(progress) = &event.progress {
            if let Some(percent) = progress.percent {
                self.report_progress(percent, progress.description.as_deref());
            }
        }

        match &event.state {
            Some(JobState::Success) => {
                self.succeed(event.result.clone().unwrap_or(Value::Null));
            }
            Some(state @ (JobState::Failed | JobState::Aborted)) => {
                let reason = event.error.clone().unwrap_or_default();
                self.finish(state.clone(), None, reason);
            }
            Some(state) => {
                let snapshot = {
                    let mut status = lock(&self.status);
                    status.state = state.clone();
                    status.clone()
                };
                self.notify(&snapshot);
            }
            None => {}
        }
    }

    /// Record an intermediate progress report
    pub fn report_progress(&mut self, percent: f64, description: Option<&str>) {
        if self.is_finished() {
            return;
        }

        let percent = if percent.is_finite() {
            percent.clamp(0.0, 100.0)
        } else {
            0.0
        };

        let snapshot = {
            let mut status = lock(&self.status);
            status.progress = percent;
            if let Some(description) = description {
                status.description = Some(description.to_string());
            }
            if status.state == JobState::Pending {
                status.state = JobState::Running;
            }
            status.clone()
        };

        if let Some(tx) = &self.progress_tx {
            // The consumer may have stopped listening
            let _ = tx.send(percent);
        }
        self.notify(&snapshot);
    }

    /// Complete the job successfully
    pub fn succeed(&mut self, result: Value) {
        self.finish(JobState::Success, Some(result), String::new());
    }

    /// Complete the job with a failure reason
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.finish(JobState::Failed, None, reason.into());
    }

    fn finish(&mut self, state: JobState, result: Option<Value>, reason: String) {
        let Some(done_tx) = self.done_tx.take() else {
            return;
        };

        let success = state == JobState::Success;
        let message = if success {
            String::new()
        } else if reason.trim().is_empty() {
            UNSPECIFIED_FAILURE.to_string()
        } else {
            reason.trim().to_string()
        };

        // The terminal message is queued under the same lock that flips
        // `finished`, so no observer sees the flag before the message.
        let snapshot = {
            let mut status = lock(&self.status);
            status.state = state;
            status.result = result;
            if !success {
                status.error = Some(message.clone());
            }
            let _ = done_tx.try_send(message);
            status.finished = true;
            status.clone()
        };

        // Closing both channels is the teardown signal
        drop(done_tx);
        self.progress_tx = None;

        self.notify(&snapshot);
    }

    fn notify(&self, status: &JobStatus) {
        if let Some(callback) = &self.callback {
            callback(
                status.progress,
                &status.state,
                status.description.as_deref().unwrap_or(""),
            );
        }
    }
}

fn lock(status: &Mutex<JobStatus>) -> MutexGuard<'_, JobStatus> {
    status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tnascert_proto::JobProgress;

    #[tokio::test]
    async fn test_progress_then_success() {
        let (mut job, mut updater) = Job::channel(5, "certificate.create");

        updater.report_progress(30.0, Some("Importing"));
        updater.succeed(json!(17));

        assert_eq!(job.progress_rx.recv().await, Some(30.0));
        assert_eq!(job.progress_rx.recv().await, None);
        assert_eq!(job.done_rx.recv().await, Some(String::new()));
        assert_eq!(job.done_rx.recv().await, None);

        let status = job.status();
        assert!(status.finished);
        assert_eq!(status.state, JobState::Success);
        assert_eq!(status.result, Some(json!(17)));
        assert_eq!(status.description.as_deref(), Some("Importing"));
    }

    #[tokio::test]
    async fn test_failure_without_reason_is_not_empty() {
        let (mut job, mut updater) = Job::channel(6, "certificate.delete");
        updater.fail("");

        let message = job.done_rx.recv().await.unwrap();
        assert_eq!(message, "job failed");
        assert_eq!(job.status().state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_updates_after_finish_are_ignored() {
        let (mut job, mut updater) = Job::channel(7, "app.update");
        updater.fail("boom");
        updater.succeed(json!(true));
        updater.report_progress(90.0, None);

        assert_eq!(job.done_rx.recv().await.as_deref(), Some("boom"));
        assert_eq!(job.done_rx.recv().await, None);
        assert_eq!(job.progress_rx.recv().await, None);
        assert_eq!(job.status().state, JobState::Failed);
    }

    #[test]
    fn test_progress_is_clamped() {
        let (job, mut updater) = Job::channel(8, "app.update");
        updater.report_progress(140.0, None);
        assert_eq!(job.status().progress, 100.0);
        updater.report_progress(-3.0, None);
        assert_eq!(job.status().progress, 0.0);
        assert!(!job.is_finished());
    }

    #[tokio::test]
    async fn test_apply_events() {
        let (mut job, mut updater) = Job::channel(9, "certificate.create");

        updater.apply(&JobEvent {
            id: 9,
            state: Some(JobState::Running),
            progress: Some(JobProgress {
                percent: Some(100.0),
                description: Some("Finalizing".to_string()),
            }),
            ..Default::default()
        });
        assert!(!job.is_finished());

        updater.apply(&JobEvent {
            id: 9,
            state: Some(JobState::Failed),
            error: Some("[EINVAL] certificate is invalid".to_string()),
            ..Default::default()
        });

        assert_eq!(job.progress_rx.recv().await, Some(100.0));
        assert_eq!(
            job.done_rx.recv().await.as_deref(),
            Some("[EINVAL] certificate is invalid")
        );
        assert!(job.is_finished());
    }

    #[test]
    fn test_callback_sees_updates() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let callback: ProgressCallback = Arc::new(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (_job, updater) = Job::channel(10, "app.update");
        let mut updater = updater.with_callback(Some(callback));
        updater.report_progress(10.0, None);
        updater.report_progress(20.0, None);
        updater.succeed(Value::Null);

        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_dropped_consumer_does_not_panic() {
        let (job, mut updater) = Job::channel(11, "app.update");
        drop(job);
        updater.report_progress(50.0, None);
        updater.succeed(Value::Null);
        assert!(updater.is_finished());
    }
}
