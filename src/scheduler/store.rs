//! Job records, idempotency index and failure streaks.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::EngineError;
use crate::models::{Job, JobId, JobSpec, JobStatus, StreamKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "jobId", rename_all = "lowercase")]
pub enum SubmitOutcome {
    /// A new pending job was recorded.
    Created(JobId),
    /// The key already has a pending, running or succeeded job.
    Duplicate(JobId),
    /// Recorded, but shed because the queue was full.
    Throttled(JobId),
    /// The stream is abandoned; nothing was recorded.
    Abandoned,
}

impl SubmitOutcome {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            SubmitOutcome::Created(id) | SubmitOutcome::Duplicate(id) | SubmitOutcome::Throttled(id) => Some(*id),
            SubmitOutcome::Abandoned => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamState {
    pub consecutive_failures: u32,
    pub abandoned: bool,
}

/// Owner of every job record. Implementations must make `submit` atomic per
/// idempotency key and `claim` atomic per job.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn submit(&self, spec: JobSpec, now: DateTime<Utc>) -> SubmitOutcome;

    /// Moves a pending job to running and counts the first attempt. `None`
    /// when the job is not pending.
    async fn claim(&self, id: JobId, now: DateTime<Utc>) -> Option<Job>;

    async fn record_retry(&self, id: JobId, error: &EngineError, now: DateTime<Utc>);

    async fn succeed(&self, id: JobId, now: DateTime<Utc>);

    /// Records a final failure and returns the resulting status: `Failed`, or
    /// `Abandoned` once the stream reaches `abandon_after` consecutive failures.
    async fn fail(&self, id: JobId, error: &EngineError, abandon_after: u32, now: DateTime<Utc>) -> JobStatus;

    async fn throttle(&self, id: JobId, now: DateTime<Utc>);

    async fn get(&self, id: JobId) -> Option<Job>;

    async fn list(&self, status: Option<JobStatus>) -> Vec<Job>;

    async fn stream(&self, key: &StreamKey) -> StreamState;

    /// Operator reset of an abandoned stream. False when it was not abandoned.
    async fn reset_stream(&self, key: &StreamKey) -> bool;
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    by_key: HashMap<JobSpec, JobId>,
    streams: HashMap<StreamKey, StreamState>,
}

#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn submit(&self, spec: JobSpec, now: DateTime<Utc>) -> SubmitOutcome {
        let mut inner = self.inner.lock().await;
        if inner.streams.get(&spec.stream_key()).is_some_and(|s| s.abandoned) {
            return SubmitOutcome::Abandoned;
        }

        let key = spec.idempotency_key();
        if let Some(existing) = inner.by_key.get(&key).and_then(|id| inner.jobs.get(id)) {
            match existing.status {
                JobStatus::Pending | JobStatus::Running | JobStatus::Succeeded => {
                    return SubmitOutcome::Duplicate(existing.id);
                }
                // failed, throttled or abandoned-then-reset keys may run again
                _ => {}
            }
        }

        let job = Job::new(spec, now);
        let id = job.id;
        inner.by_key.insert(key, id);
        inner.jobs.insert(id, job);
        SubmitOutcome::Created(id)
    }

    async fn claim(&self, id: JobId, now: DateTime<Utc>) -> Option<Job> {
        let mut inner = self.inner.lock().await;
        let job = inner.jobs.get_mut(&id)?;
        if job.status != JobStatus::Pending {
            return None;
        }
        job.status = JobStatus::Running;
        job.attempts += 1;
        job.updated_at = now;
        Some(job.clone())
    }

    async fn record_retry(&self, id: JobId, error: &EngineError, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(&id) {
            job.attempts += 1;
            job.last_error = Some(error.to_string());
            job.updated_at = now;
        }
    }

    async fn succeed(&self, id: JobId, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.jobs.get_mut(&id) else {
            return;
        };
        job.status = JobStatus::Succeeded;
        job.updated_at = now;
        let stream = job.spec.stream_key();
        inner.streams.remove(&stream);
    }

    async fn fail(&self, id: JobId, error: &EngineError, abandon_after: u32, now: DateTime<Utc>) -> JobStatus {
        let mut inner = self.inner.lock().await;
        let Some(stream_key) = inner.jobs.get(&id).map(|j| j.spec.stream_key()) else {
            return JobStatus::Failed;
        };

        let stream_name = format!(
            "{}/{}/{}",
            stream_key.kind, stream_key.patient_id, stream_key.definition_id
        );
        let stream = inner.streams.entry(stream_key).or_default();
        stream.consecutive_failures += 1;
        if stream.consecutive_failures >= abandon_after {
            stream.abandoned = true;
        }
        let (status, recorded) = if stream.abandoned {
            let abandoned = EngineError::Abandoned {
                stream: stream_name,
                failures: stream.consecutive_failures,
                cause: error.to_string(),
            };
            (JobStatus::Abandoned, abandoned.to_string())
        } else {
            (JobStatus::Failed, error.to_string())
        };

        if let Some(job) = inner.jobs.get_mut(&id) {
            job.status = status;
            job.last_error = Some(recorded);
            job.updated_at = now;
        }
        status
    }

    async fn throttle(&self, id: JobId, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(&id) {
            job.status = JobStatus::Throttled;
            job.updated_at = now;
        }
    }

    async fn get(&self, id: JobId) -> Option<Job> {
        self.inner.lock().await.jobs.get(&id).cloned()
    }

    async fn list(&self, status: Option<JobStatus>) -> Vec<Job> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    async fn stream(&self, key: &StreamKey) -> StreamState {
        self.inner.lock().await.streams.get(key).cloned().unwrap_or_default()
    }

    async fn reset_stream(&self, key: &StreamKey) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.streams.get(key) {
            Some(state) if state.abandoned => {
                inner.streams.remove(key);
                true
            }
            _ => false,
        }
    }
}
