//! Job notification payloads
//!
//! Long-running server operations report their progress through the
//! `core.get_jobs` collection. After `core.subscribe`, every change is
//! pushed as a `collection_update` notification whose `fields` member
//! carries (part of) the job record.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::methods::CORE_GET_JOBS;

/// Server-controlled job state
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobState {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Aborted,
    Other(String),
}

impl JobState {
    pub fn as_str(&self) -> &str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Success => "SUCCESS",
            JobState::Failed => "FAILED",
            JobState::Aborted => "ABORTED",
            JobState::Other(s) => s,
        }
    }

    /// Whether the state ends the job
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::Failed | JobState::Aborted
        )
    }
}

impl From<&str> for JobState {
    fn from(value: &str) -> Self {
        match value {
            "PENDING" => JobState::Pending,
            "RUNNING" => JobState::Running,
            "SUCCESS" => JobState::Success,
            "FAILED" => JobState::Failed,
            "ABORTED" => JobState::Aborted,
            other => JobState::Other(other.to_string()),
        }
    }
}

impl From<String> for JobState {
    fn from(value: String) -> Self {
        JobState::from(value.as_str())
    }
}

impl From<JobState> for String {
    fn from(value: JobState) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress member of a job record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    #[serde(default)]
    pub percent: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
}

/// One observed change of a job record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub state: Option<JobState>,
    #[serde(default)]
    pub progress: Option<JobProgress>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Params of a `collection_update` notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionUpdate {
    pub msg: String,
    pub collection: String,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub fields: Option<Value>,
}

impl CollectionUpdate {
    /// Extract the job event if this update belongs to the jobs collection
    ///
    /// Returns `None` for other collections, removals, and records without
    /// a usable job id.
    pub fn job_event(&self) -> Option<JobEvent> {
        if self.collection != CORE_GET_JOBS || self.msg == "removed" {
            return None;
        }

        let mut event: JobEvent = match &self.fields {
            Some(fields) => serde_json::from_value(fields.clone()).ok()?,
            None => JobEvent::default(),
        };

        if event.id == 0 {
            event.id = self.id.as_ref().and_then(Value::as_i64).unwrap_or(0);
        }

        if event.id == 0 {
            None
        } else {
            Some(event)
        }
    }
}
