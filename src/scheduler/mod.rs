//! Nightly batch recomputation.
//!
//! The [`Scheduler`] enumerates the active population, submits one job per
//! patient and definition through the [`JobStore`] (which enforces
//! idempotency and tracks failure streaks) and feeds the job ids to two
//! bounded lanes: evaluation (measure and rules jobs) and insights. Each lane
//! has its own workers, retry policy and timeout.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc::error::TrySendError, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::EngineResult;
use crate::models::{DedupKey, Job, JobId, JobKind, JobSpec, JobStatus, StreamKey};

pub mod retry;
pub mod store;
pub mod worker;

pub use retry::RetryPolicy;
pub use store::{InMemoryJobStore, JobStore, StreamState, SubmitOutcome};
pub use worker::Pipeline;

use worker::{Lane, Shared};

const HEAD_LOOKUPS_IN_FLIGHT: usize = 16;

/// What the enqueuer does when a lane's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backpressure {
    /// Wait for room.
    Block,
    /// Drop the job and record it as throttled.
    Shed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub evaluation_workers: usize,
    pub insights_workers: usize,
    pub queue_depth: usize,
    pub backpressure: Backpressure,
    pub retry: RetryPolicy,
    pub insights_retry: RetryPolicy,
    pub job_timeout_ms: u64,
    pub insights_timeout_ms: u64,
    /// Consecutive failed runs after which a stream is abandoned.
    pub abandon_after: u32,
    /// UTC hour of the daily run; no automatic trigger when unset.
    #[serde(default)]
    pub nightly_hour: Option<u32>,
    #[serde(default)]
    pub insights_enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            evaluation_workers: 4,
            insights_workers: 2,
            queue_depth: 1024,
            backpressure: Backpressure::Block,
            retry: RetryPolicy::default(),
            insights_retry: RetryPolicy::new(2, Duration::from_secs(10), Duration::from_secs(60)),
            job_timeout_ms: 30_000,
            insights_timeout_ms: 120_000,
            abandon_after: 6,
            nightly_hour: None,
            insights_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub patients: usize,
    /// Patients whose head version could not be read.
    pub skipped_patients: usize,
    /// Jobs created by this run.
    pub jobs: Vec<JobId>,
    pub duplicates: usize,
    pub throttled: usize,
    pub abandoned: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub abandoned: usize,
    pub throttled: usize,
    /// Jobs nothing will run because the scheduler was cancelled first.
    pub pending: usize,
}

pub struct Scheduler {
    config: SchedulerConfig,
    shared: Arc<Shared>,
    evaluation: Lane,
    insights: Lane,
    cancel: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    trigger: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, pipeline: Pipeline, store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        let evaluation = Lane::new(
            "evaluation",
            config.queue_depth,
            config.evaluation_workers,
            config.retry,
            Duration::from_millis(config.job_timeout_ms),
        );
        let insights = Lane::new(
            "insights",
            config.queue_depth,
            config.insights_workers,
            config.insights_retry,
            Duration::from_millis(config.insights_timeout_ms),
        );
        let (cancel, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            store,
            pipeline,
            clock,
            abandon_after: config.abandon_after.max(1),
            progress: Notify::new(),
        });

        Self {
            config,
            shared,
            evaluation,
            insights,
            cancel,
            workers: Mutex::new(Vec::new()),
            trigger: Mutex::new(None),
        }
    }

    /// Spawns the lane workers and, when configured, the daily trigger.
    pub async fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }
        let cancel = self.cancel.subscribe();
        workers.extend(self.evaluation.spawn_workers(&self.shared, &cancel));
        workers.extend(self.insights.spawn_workers(&self.shared, &cancel));
        info!(
            evaluation_workers = self.evaluation.workers,
            insights_workers = self.insights.workers,
            "scheduler started"
        );

        if let Some(hour) = self.config.nightly_hour {
            let scheduler = Arc::clone(self);
            *self.trigger.lock().await = Some(tokio::spawn(async move { scheduler.daily_trigger(hour).await }));
        }
    }

    /// Stops workers from taking new jobs. Jobs already running finish.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Cancels and waits for every in-flight job to reach a terminal status.
    pub async fn shutdown(&self) {
        self.cancel();
        if let Some(trigger) = self.trigger.lock().await.take() {
            trigger.abort();
        }
        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
        info!("scheduler stopped");
    }

    fn lane(&self, kind: JobKind) -> &Lane {
        match kind {
            JobKind::Insights => &self.insights,
            JobKind::Measure | JobKind::Rules => &self.evaluation,
        }
    }

    /// Records the job and queues it on its lane.
    #[instrument(skip(self), fields(kind = %spec.kind, patient_id = %spec.patient_id))]
    pub async fn submit(&self, spec: JobSpec) -> SubmitOutcome {
        let lane = self.lane(spec.kind);
        let outcome = self.shared.store.submit(spec, self.shared.clock.now()).await;
        let SubmitOutcome::Created(id) = outcome else {
            return outcome;
        };

        match self.config.backpressure {
            Backpressure::Block => {
                let mut cancel = self.cancel.subscribe();
                if *cancel.borrow_and_update() {
                    warn!(%id, "scheduler cancelled, job left pending");
                    return outcome;
                }
                tokio::select! {
                    sent = lane.tx.send(id) => {
                        if sent.is_err() {
                            error!(%id, "lane queue closed");
                        }
                    }
                    _ = cancel.changed() => {
                        warn!(%id, lane = lane.name, "cancelled while waiting for queue room, job left pending");
                    }
                }
                outcome
            }
            Backpressure::Shed => match lane.tx.try_send(id) {
                Ok(()) => outcome,
                Err(TrySendError::Full(_)) => {
                    warn!(%id, lane = lane.name, "queue full, job throttled");
                    self.shared.store.throttle(id, self.shared.clock.now()).await;
                    SubmitOutcome::Throttled(id)
                }
                Err(TrySendError::Closed(_)) => {
                    error!(%id, "lane queue closed");
                    outcome
                }
            },
        }
    }

    /// Enqueues one job per measure and rule set (and an insights job when
    /// enabled) for every active patient at their current head version.
    #[instrument(skip(self))]
    pub async fn run_nightly(&self) -> EngineResult<RunReport> {
        let pipeline = &self.shared.pipeline;
        let source = pipeline.contexts.source();
        let patients = source.active_patients().await?;

        let mut report = RunReport {
            run_id: Uuid::new_v4(),
            started_at: self.shared.clock.now(),
            patients: patients.len(),
            skipped_patients: 0,
            jobs: Vec::new(),
            duplicates: 0,
            throttled: 0,
            abandoned: 0,
        };

        let heads: Vec<(String, EngineResult<u64>)> = stream::iter(patients)
            .map(|patient| async move {
                let head = source.head_version(&patient).await;
                (patient, head)
            })
            .buffered(HEAD_LOOKUPS_IN_FLIGHT)
            .collect()
            .await;

        for (patient, head) in &heads {
            let version = match head {
                Ok(v) => *v,
                Err(e) => {
                    warn!(patient_id = %patient, error = %e, "skipping patient");
                    report.skipped_patients += 1;
                    continue;
                }
            };

            let mut specs: Vec<JobSpec> = pipeline
                .registry
                .measures()
                .map(|m| JobSpec::new(JobKind::Measure, patient.as_str(), m.id(), version))
                .collect();
            specs.extend(
                pipeline
                    .registry
                    .rule_sets()
                    .map(|r| JobSpec::new(JobKind::Rules, patient.as_str(), r.id(), version)),
            );
            if self.config.insights_enabled {
                specs.push(JobSpec::new(JobKind::Insights, patient.as_str(), "narrative", version));
            }

            for spec in specs {
                match self.submit(spec).await {
                    SubmitOutcome::Created(id) => report.jobs.push(id),
                    SubmitOutcome::Duplicate(_) => report.duplicates += 1,
                    SubmitOutcome::Throttled(id) => {
                        report.jobs.push(id);
                        report.throttled += 1;
                    }
                    SubmitOutcome::Abandoned => report.abandoned += 1,
                }
            }
        }

        info!(
            run_id = %report.run_id,
            patients = report.patients,
            jobs = report.jobs.len(),
            duplicates = report.duplicates,
            abandoned = report.abandoned,
            "nightly run enqueued"
        );
        Ok(report)
    }

    /// Waits until every job created by the run is terminal. Once the
    /// scheduler is cancelled it only waits for running jobs and reports the
    /// rest as pending.
    pub async fn wait_for_run(&self, report: &RunReport) -> RunSummary {
        let mut cancel = self.cancel.subscribe();
        loop {
            let notified = self.shared.progress.notified();

            let mut summary = RunSummary::default();
            let mut running = 0;
            for id in &report.jobs {
                match self.shared.store.get(*id).await.map(|j| j.status) {
                    Some(JobStatus::Succeeded) => summary.succeeded += 1,
                    Some(JobStatus::Failed) => summary.failed += 1,
                    Some(JobStatus::Abandoned) => summary.abandoned += 1,
                    Some(JobStatus::Throttled) => summary.throttled += 1,
                    Some(JobStatus::Pending) => summary.pending += 1,
                    Some(JobStatus::Running) => running += 1,
                    None => {}
                }
            }
            if running == 0 && (summary.pending == 0 || *cancel.borrow_and_update()) {
                return summary;
            }
            tokio::select! {
                _ = notified => {}
                _ = cancel.changed() => {}
            }
        }
    }

    pub async fn job(&self, id: JobId) -> Option<Job> {
        self.shared.store.get(id).await
    }

    pub async fn jobs(&self, status: Option<JobStatus>) -> Vec<Job> {
        self.shared.store.list(status).await
    }

    /// Operator reset of an abandoned stream.
    pub async fn reset(&self, key: &StreamKey) -> bool {
        let reset = self.shared.store.reset_stream(key).await;
        if reset {
            info!(kind = %key.kind, patient_id = %key.patient_id, definition = %key.definition_id, "stream reset");
        }
        reset
    }

    /// Operator resolution of an open care-gap alert. A later rules job
    /// emits it again if the gap still holds.
    pub async fn resolve_alert(&self, key: &DedupKey) -> EngineResult<bool> {
        let pipeline = &self.shared.pipeline;
        let stored = pipeline.results.resolve_alert(key, self.shared.clock.now()).await?;
        let released = pipeline.rules.resolve(key);
        if stored || released {
            info!(dedup_key = %key, "alert resolved by operator");
        }
        Ok(stored || released)
    }

    async fn daily_trigger(self: Arc<Self>, hour: u32) {
        let mut cancel = self.cancel.subscribe();
        loop {
            let now = self.shared.clock.now();
            let wait = (next_run_at(now, hour) - now).to_std().unwrap_or_default();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.changed() => return,
            }
            if self.is_cancelled() {
                return;
            }
            match self.run_nightly().await {
                Ok(report) => info!(run_id = %report.run_id, jobs = report.jobs.len(), "scheduled run started"),
                Err(e) => error!(error = %e, "scheduled run failed to enqueue"),
            }
        }
    }
}

/// The next instant strictly after `now` at `hour:00` UTC.
pub fn next_run_at(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let Some(at) = now.date_naive().and_hms_opt(hour.min(23), 0, 0) else {
        return now + ChronoDuration::days(1);
    };
    let today = Utc.from_utc_datetime(&at);
    if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}
