//! Waiting for jobs to reach a terminal state

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::job::{Job, ProgressCallback};
use crate::{RemoteClient, TransportError};

/// Job failures
#[derive(Debug, Error)]
pub enum JobError {
    #[error("failed to start the {method} job: {source}")]
    Start {
        method: String,
        #[source]
        source: TransportError,
    },

    #[error("job {id} failed: {reason}")]
    Failed { id: i64, reason: String },

    #[error("job {id} timed out after {timeout:?} without activity")]
    Timeout { id: i64, timeout: Duration },

    #[error("job {id} ended without reporting completion")]
    Abandoned { id: i64 },
}

enum Activity {
    Progress(Option<f64>),
    Done(Option<String>),
}

/// Block until the job completes
///
/// Progress values are handed to `on_progress` in the order they were
/// produced and never end the wait. The wait ends on the terminal message:
/// a non-empty message is a failure carrying that message, an empty one is
/// success once the job reports `finished`. If neither channel shows any
/// activity for `idle_timeout` the job is treated as failed.
pub async fn wait_for_job<F>(
    job: &mut Job,
    idle_timeout: Duration,
    mut on_progress: F,
) -> Result<Value, JobError>
where
    F: FnMut(f64),
{
    let id = job.id();
    let mut progress_open = true;

    loop {
        let Job {
            progress_rx,
            done_rx,
            ..
        } = &mut *job;

        let activity = tokio::time::timeout(idle_timeout, async {
            tokio::select! {
                // Drain queued progress before looking at completion
                biased;
                progress = progress_rx.recv(), if progress_open => Activity::Progress(progress),
                done = done_rx.recv() => Activity::Done(done),
            }
        })
        .await;

        match activity {
            Err(_) => {
                return Err(JobError::Timeout {
                    id,
                    timeout: idle_timeout,
                })
            }
            Ok(Activity::Progress(Some(percent))) => on_progress(percent),
            Ok(Activity::Progress(None)) => progress_open = false,
            Ok(Activity::Done(Some(message))) => {
                if !message.is_empty() {
                    return Err(JobError::Failed {
                        id,
                        reason: message,
                    });
                }
                if job.is_finished() {
                    return Ok(job.status().result.unwrap_or(Value::Null));
                }
            }
            Ok(Activity::Done(None)) => return Err(JobError::Abandoned { id }),
        }
    }
}

/// Start a job and wait for it to finish
pub async fn run_job<C>(
    client: &C,
    method: &str,
    params: Value,
    idle_timeout: Duration,
) -> Result<Value, JobError>
where
    C: RemoteClient + ?Sized,
{
    let callback: ProgressCallback = Arc::new(|progress, state, description| {
        debug!(
            "Job progress: {:.2}%, state: {}, description: {}",
            progress, state, description
        );
    });

    let mut job = client
        .call_with_job(method, params, Some(callback))
        .await
        .map_err(|source| JobError::Start {
            method: method.to_string(),
            source,
        })?;

    if job.id() > 0 {
        info!("Started the {} job with ID {}", method, job.id());
    }

    let id = job.id();
    let result = wait_for_job(&mut job, idle_timeout, |progress| {
        debug!("Job {} progress: {:.2}%", id, progress);
    })
    .await?;

    debug!("Job {} ({}) completed successfully", id, method);
    Ok(result)
}
