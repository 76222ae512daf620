//! Remote call abstraction for the TrueNAS API
//!
//! This crate provides the transport-agnostic interface the deployment
//! pipeline is written against, together with the job machinery that turns
//! a "job started" reply into a blocking wait for the job's terminal state.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                Deployment orchestrator                  │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ call / call_with_job + run_job
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │          tnascert-transport (this crate)                │
//! │  - RemoteClient        - Job / JobUpdater               │
//! │  - wait_for_job        - JobRouter                      │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │      tnascert-transport-websocket (ws:// and wss://)    │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! A job has two channels: an informational progress channel and a
//! completion channel that carries exactly one terminal message (empty
//! string for success, the failure reason otherwise). Reaching 100%
//! progress is never taken as completion.

pub mod job;
pub mod router;
pub mod tracker;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use job::{Job, JobStatus, JobUpdater, ProgressCallback};
pub use router::JobRouter;
pub use tracker::{run_job, wait_for_job, JobError};

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Remote call {method} failed: {message}")]
    RemoteError { method: String, message: String },
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Login credentials
///
/// Exactly one credential form is sent to the server.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    ApiKey(String),
    UserPassword { username: String, password: String },
}

impl Credentials {
    /// Pick the credential form to use, preferring the API key
    ///
    /// Returns `None` when neither an API key nor a complete
    /// username/password pair is available.
    pub fn resolve(
        username: Option<&str>,
        password: Option<&str>,
        api_key: Option<&str>,
    ) -> Option<Self> {
        let present = |s: Option<&str>| s.filter(|s| !s.is_empty()).map(str::to_string);

        if let Some(key) = present(api_key) {
            return Some(Credentials::ApiKey(key));
        }

        match (present(username), present(password)) {
            (Some(username), Some(password)) => {
                Some(Credentials::UserPassword { username, password })
            }
            _ => None,
        }
    }

    /// Short label for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Credentials::ApiKey(_) => "API key",
            Credentials::UserPassword { .. } => "username and password",
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::ApiKey(_) => f.write_str("Credentials::ApiKey(<redacted>)"),
            Credentials::UserPassword { username, .. } => f
                .debug_struct("Credentials::UserPassword")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// An authenticated request/response channel to the appliance
///
/// Implementations own the connection; callers only see method names and
/// JSON parameters. `call` returns the `result` member of the reply.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Authenticate the connection
    async fn login(&self, credentials: &Credentials) -> TransportResult<()>;

    /// Synchronous request/response
    async fn call(&self, method: &str, timeout: Duration, params: Value) -> TransportResult<Value>;

    /// Start a long-running server-side job
    ///
    /// The returned [`Job`] is already wired to the notification stream.
    /// An error here means the job was never started.
    async fn call_with_job(
        &self,
        method: &str,
        params: Value,
        callback: Option<ProgressCallback>,
    ) -> TransportResult<Job>;

    /// Subscribe to job notifications
    ///
    /// Must be invoked before the first `call_with_job` whose completion is
    /// tracked through notifications.
    async fn subscribe_to_jobs(&self) -> TransportResult<()>;

    /// Release the connection (idempotent)
    async fn close(&self) -> TransportResult<()>;
}
