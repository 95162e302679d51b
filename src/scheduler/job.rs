use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Category of interchangeable resources, e.g. `cisco/c8k`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceClass {
    pub vendor: String,
    pub model: String,
}

impl ResourceClass {
    pub fn new(vendor: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            vendor: vendor.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.vendor, self.model)
    }
}

impl FromStr for ResourceClass {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once('/') {
            Some((vendor, model))
                if !vendor.is_empty() && !model.is_empty() && !model.contains('/') =>
            {
                Ok(Self::new(vendor, model))
            }
            _ => Err(BatchError::InvalidResourceSpec(format!(
                "expected vendor/model, got {s:?}"
            ))),
        }
    }
}

/// Opaque locator for a job's stored input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadRef(pub String);

impl fmt::Display for PayloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub version: String,
    pub class: ResourceClass,
    pub status: JobStatus,
    pub payload_ref: PayloadRef,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set if and only if `status == Running`.
    pub bound_resource: Option<String>,
    pub result_data: Option<String>,
}

impl Job {
    pub fn new(id: Uuid, version: String, class: ResourceClass, payload_ref: PayloadRef) -> Self {
        Self::with_enqueued_at(id, version, class, payload_ref, Utc::now())
    }

    pub fn with_enqueued_at(
        id: Uuid,
        version: String,
        class: ResourceClass,
        payload_ref: PayloadRef,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            version,
            class,
            status: JobStatus::Queued,
            payload_ref,
            enqueued_at,
            started_at: None,
            completed_at: None,
            bound_resource: None,
            result_data: None,
        }
    }

    /// Apply a partial update, keeping the resource binding consistent with the status.
    pub fn apply(&mut self, update: JobUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(bound) = update.bound_resource {
            self.bound_resource = bound;
        }
        if let Some(started_at) = update.started_at {
            self.started_at = started_at;
        }
        if let Some(completed_at) = update.completed_at {
            self.completed_at = Some(completed_at);
        }
        if let Some(result_data) = update.result_data {
            self.result_data = Some(result_data);
        }
        if self.status != JobStatus::Running {
            self.bound_resource = None;
        }
    }
}

/// Partial update for a [`Job`]. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub bound_resource: Option<Option<String>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_data: Option<String>,
}

impl JobUpdate {
    pub fn running(resource_id: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Running),
            bound_resource: Some(Some(resource_id.into())),
            started_at: Some(Some(Utc::now())),
            ..Default::default()
        }
    }

    pub fn finished(success: bool, result_data: String) -> Self {
        Self {
            status: Some(if success {
                JobStatus::Completed
            } else {
                JobStatus::Failed
            }),
            bound_resource: Some(None),
            completed_at: Some(Utc::now()),
            result_data: Some(result_data),
            ..Default::default()
        }
    }

    /// Undo a dispatch whose handoff to the executor failed.
    pub fn requeued() -> Self {
        Self {
            status: Some(JobStatus::Queued),
            bound_resource: Some(None),
            started_at: Some(None),
            ..Default::default()
        }
    }
}
