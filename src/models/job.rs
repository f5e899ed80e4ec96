use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Measure,
    Rules,
    Insights,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobKind::Measure => "measure",
            JobKind::Rules => "rules",
            JobKind::Insights => "insights",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Abandoned,
    /// Shed by the enqueuer because the queue was full.
    Throttled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

/// What to compute: the fields a producer hands to the job submission interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub kind: JobKind,
    pub patient_id: String,
    pub definition_id: String,
    pub context_version: u64,
}

impl JobSpec {
    pub fn new(
        kind: JobKind,
        patient_id: impl Into<String>,
        definition_id: impl Into<String>,
        context_version: u64,
    ) -> Self {
        Self {
            kind,
            patient_id: patient_id.into(),
            definition_id: definition_id.into(),
            context_version,
        }
    }

    /// (kind, patient, definition, context version): one successful execution per key.
    pub fn idempotency_key(&self) -> JobSpec {
        self.clone()
    }

    /// The same work across context versions; consecutive failures accumulate here.
    pub fn stream_key(&self) -> StreamKey {
        StreamKey {
            kind: self.kind,
            patient_id: self.patient_id.clone(),
            definition_id: self.definition_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamKey {
    pub kind: JobKind,
    pub patient_id: String,
    pub definition_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    #[serde(flatten)]
    pub spec: JobSpec,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(spec: JobSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            spec,
            status: JobStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}
