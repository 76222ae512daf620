//! Job notification router
//!
//! Routes `core.get_jobs` notifications to the producer of the matching job.
//! The subscription reports every job on the appliance, and an update for
//! one of our jobs can arrive before the reply that tells us its id, so
//! updates for unknown ids are buffered for a bounded number of jobs.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tnascert_proto::JobEvent;
use tracing::{debug, trace};

use crate::job::JobUpdater;

/// Maximum number of unknown job ids whose updates are kept
const MAX_BUFFERED_JOBS: usize = 128;

/// Maximum number of buffered updates per unknown job id
const MAX_EVENTS_PER_JOB: usize = 64;

#[derive(Default)]
struct RouterState {
    active: HashMap<i64, JobUpdater>,
    early: HashMap<i64, Vec<JobEvent>>,
    early_order: VecDeque<i64>,
    closed: Option<String>,
}

/// Tracks the producers of in-flight jobs
#[derive(Default)]
pub struct JobRouter {
    state: Mutex<RouterState>,
}

impl JobRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start routing updates to a job producer
    ///
    /// Buffered updates for the job are replayed first.
    pub fn register(&self, mut updater: JobUpdater) {
        let mut state = self.lock();
        let id = updater.id();

        if let Some(reason) = &state.closed {
            updater.fail(reason.clone());
            return;
        }

        if let Some(events) = state.early.remove(&id) {
            state.early_order.retain(|buffered| *buffered != id);
            debug!("Replaying {} buffered updates for job {}", events.len(), id);
            for event in &events {
                updater.apply(event);
            }
        }

        if !updater.is_finished() {
            state.active.insert(id, updater);
        }
    }

    /// Route one update
    ///
    /// Returns true if the update was delivered to a registered job.
    pub fn dispatch(&self, event: JobEvent) -> bool {
        let mut state = self.lock();
        let id = event.id;

        if let Some(updater) = state.active.get_mut(&id) {
            updater.apply(&event);
            if updater.is_finished() {
                state.active.remove(&id);
                debug!("Job {} reached a terminal state", id);
            }
            return true;
        }

        if state.closed.is_some() {
            return false;
        }

        trace!("Buffering update for unregistered job {}", id);
        if !state.early.contains_key(&id) {
            if state.early_order.len() >= MAX_BUFFERED_JOBS {
                if let Some(oldest) = state.early_order.pop_front() {
                    state.early.remove(&oldest);
                }
            }
            state.early_order.push_back(id);
        }
        let events = state.early.entry(id).or_default();
        if events.len() >= MAX_EVENTS_PER_JOB {
            // Make room by dropping the oldest intermediate update
            match events.iter().position(|e| !is_terminal(e)) {
                Some(oldest) => {
                    events.remove(oldest);
                }
                None => return false,
            }
        }
        events.push(event);
        false
    }

    /// Fail every in-flight job and refuse new ones
    pub fn close(&self, reason: &str) {
        let mut state = self.lock();
        if state.closed.is_none() {
            state.closed = Some(reason.to_string());
        }
        for (id, mut updater) in state.active.drain() {
            debug!("Failing job {}: {}", id, reason);
            updater.fail(reason);
        }
        state.early.clear();
        state.early_order.clear();
    }

    /// Number of registered jobs that have not finished
    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn is_terminal(event: &JobEvent) -> bool {
    event.state.as_ref().is_some_and(|state| state.is_terminal())
}
