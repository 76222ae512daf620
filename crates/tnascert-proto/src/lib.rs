//! TrueNAS API protocol definitions
//!
//! This crate defines the JSON-RPC 2.0 envelopes spoken on the
//! `/api/current` endpoint, the job-notification payloads pushed by the
//! `core.get_jobs` subscription, and the names of the remote methods the
//! deployment pipeline invokes.

pub mod jobs;
pub mod messages;
pub mod methods;

pub use jobs::{CollectionUpdate, JobEvent, JobProgress, JobState};
pub use messages::*;

/// JSON-RPC protocol version string
pub const JSONRPC_VERSION: &str = "2.0";

/// API endpoint path appended to the server URL
pub const API_ENDPOINT: &str = "/api/current";
