//! Scripted in-memory client for tests
//!
//! Replies and job outcomes are configured per method name. Every request
//! is recorded so tests can assert on what was sent.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::job::{Job, JobUpdater, ProgressCallback};
use crate::{Credentials, RemoteClient, TransportError, TransportResult};

type CallHandler = Arc<dyn Fn(&Value) -> TransportResult<Value> + Send + Sync>;

/// What a scripted job does once started
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Success { progress: Vec<f64>, result: Value },
    Failure { progress: Vec<f64>, reason: String },
    /// `call_with_job` itself fails; no job is created
    StartError(String),
    /// The job never reports again
    Stalled,
}

impl JobOutcome {
    pub fn success(result: Value) -> Self {
        JobOutcome::Success {
            progress: Vec::new(),
            result,
        }
    }

    pub fn failure(progress: Vec<f64>, reason: impl Into<String>) -> Self {
        JobOutcome::Failure {
            progress,
            reason: reason.into(),
        }
    }
}

/// Kind of recorded request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Login,
    Call,
    Job,
    Subscribe,
    Close,
}

/// One recorded request
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub kind: CallKind,
    pub method: String,
    pub params: Value,
}

#[derive(Default)]
struct MockState {
    calls: Vec<RecordedCall>,
    handlers: HashMap<String, CallHandler>,
    jobs: HashMap<String, VecDeque<JobOutcome>>,
    stalled: Vec<JobUpdater>,
    login_error: Option<String>,
    subscribe_error: Option<String>,
    subscribed: bool,
    closed: bool,
    next_job_id: i64,
}

/// In-memory [`RemoteClient`]
#[derive(Default)]
pub struct MockClient {
    state: Mutex<MockState>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply to every `call(method)` with `result`
    pub fn on_call(self, method: &str, result: Value) -> Self {
        self.on_call_with(method, move |_| Ok(result.clone()))
    }

    /// Fail every `call(method)` with a remote error
    pub fn on_call_error(self, method: &str, message: &str) -> Self {
        let method_name = method.to_string();
        let message = message.to_string();
        self.on_call_with(method, move |_| {
            Err(TransportError::RemoteError {
                method: method_name.clone(),
                message: message.clone(),
            })
        })
    }

    /// Reply to `call(method)` depending on its parameters
    pub fn on_call_with<F>(self, method: &str, handler: F) -> Self
    where
        F: Fn(&Value) -> TransportResult<Value> + Send + Sync + 'static,
    {
        self.lock()
            .handlers
            .insert(method.to_string(), Arc::new(handler));
        self
    }

    /// Queue the outcome of the next `call_with_job(method)`
    ///
    /// Jobs without a queued outcome succeed with a null result.
    pub fn on_job(self, method: &str, outcome: JobOutcome) -> Self {
        self.lock()
            .jobs
            .entry(method.to_string())
            .or_default()
            .push_back(outcome);
        self
    }

    pub fn with_login_error(self, message: &str) -> Self {
        self.lock().login_error = Some(message.to_string());
        self
    }

    pub fn with_subscribe_error(self, message: &str) -> Self {
        self.lock().subscribe_error = Some(message.to_string());
        self
    }

    /// Every request in the order it was made
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Method names in the order they were invoked
    pub fn methods(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .map(|call| call.method.clone())
            .collect()
    }

    /// Parameters of every synchronous call to `method`
    pub fn call_params(&self, method: &str) -> Vec<Value> {
        self.params_of(CallKind::Call, method)
    }

    /// Parameters of every job started with `method`
    pub fn job_params(&self, method: &str) -> Vec<Value> {
        self.params_of(CallKind::Job, method)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn params_of(&self, kind: CallKind, method: &str) -> Vec<Value> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.kind == kind && call.method == method)
            .map(|call| call.params.clone())
            .collect()
    }

    fn record(&self, kind: CallKind, method: &str, params: Value) {
        self.lock().calls.push(RecordedCall {
            kind,
            method: method.to_string(),
            params,
        });
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RemoteClient for MockClient {
    async fn login(&self, credentials: &Credentials) -> TransportResult<()> {
        let method = match credentials {
            Credentials::ApiKey(_) => "auth.login_with_api_key",
            Credentials::UserPassword { .. } => "auth.login",
        };
        self.record(CallKind::Login, method, Value::Null);

        match &self.lock().login_error {
            Some(message) => Err(TransportError::AuthenticationFailed(message.clone())),
            None => Ok(()),
        }
    }

    async fn call(&self, method: &str, _timeout: Duration, params: Value) -> TransportResult<Value> {
        self.record(CallKind::Call, method, params.clone());

        let handler = {
            let state = self.lock();
            if state.closed {
                return Err(TransportError::ConnectionClosed);
            }
            state.handlers.get(method).cloned()
        };

        match handler {
            Some(handler) => handler(&params),
            None => Ok(Value::Null),
        }
    }

    async fn call_with_job(
        &self,
        method: &str,
        params: Value,
        callback: Option<ProgressCallback>,
    ) -> TransportResult<Job> {
        self.record(CallKind::Job, method, params);

        let mut state = self.lock();
        if state.closed {
            return Err(TransportError::ConnectionClosed);
        }
        if !state.subscribed {
            return Err(TransportError::ProtocolError(
                "job started before subscribing to job notifications".to_string(),
            ));
        }

        let outcome = state
            .jobs
            .get_mut(method)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| JobOutcome::success(Value::Null));

        if let JobOutcome::StartError(message) = &outcome {
            return Err(TransportError::RemoteError {
                method: method.to_string(),
                message: message.clone(),
            });
        }

        state.next_job_id += 1;
        let (job, updater) = Job::channel(state.next_job_id, method);
        let mut updater = updater.with_callback(callback);

        match outcome {
            JobOutcome::Success { progress, result } => {
                for percent in progress {
                    updater.report_progress(percent, None);
                }
                updater.succeed(result);
            }
            JobOutcome::Failure { progress, reason } => {
                for percent in progress {
                    updater.report_progress(percent, None);
                }
                updater.fail(reason);
            }
            JobOutcome::Stalled => state.stalled.push(updater),
            JobOutcome::StartError(_) => {}
        }

        Ok(job)
    }

    async fn subscribe_to_jobs(&self) -> TransportResult<()> {
        self.record(CallKind::Subscribe, "core.subscribe", Value::Null);

        let mut state = self.lock();
        if let Some(message) = &state.subscribe_error {
            return Err(TransportError::RemoteError {
                method: "core.subscribe".to_string(),
                message: message.clone(),
            });
        }
        state.subscribed = true;
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.record(CallKind::Close, "close", Value::Null);

        let mut state = self.lock();
        state.closed = true;
        for mut updater in state.stalled.drain(..) {
            updater.fail("connection closed");
        }
        Ok(())
    }
}
