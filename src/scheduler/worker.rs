//! Job execution: what each job kind computes, and the lane workers that
//! claim jobs, run them under a timeout and retry transient failures.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, TimeZone, Utc};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_retry::RetryIf;
use tracing::{error, info, instrument, warn, Instrument};

use crate::clock::Clock;
use crate::core::ai::{insight_prompt, NarrativeService};
use crate::core::{ContextBuilder, DefinitionRegistry, MeasureEngine, RiskScoringModule, RulesEngine};
use crate::db::ResultStore;
use crate::error::{EngineError, EngineResult};
use crate::models::{JobId, JobKind, JobSpec, JobStatus, Narrative, PatientContext, Period};

use super::retry::RetryPolicy;
use super::store::JobStore;

/// Everything a job needs to turn a spec into persisted results.
#[derive(Clone)]
pub struct Pipeline {
    pub registry: Arc<DefinitionRegistry>,
    pub contexts: Arc<ContextBuilder>,
    pub measures: Arc<MeasureEngine>,
    pub rules: Arc<RulesEngine>,
    pub risk: Arc<RiskScoringModule>,
    pub results: Arc<dyn ResultStore>,
    pub narratives: Option<Arc<dyn NarrativeService>>,
    pub clock: Arc<dyn Clock>,
    /// Length of the reporting period ending at the start of the current UTC day.
    pub period_months: u32,
}

impl Pipeline {
    fn reporting_period(&self) -> EngineResult<Period> {
        let now = self.clock.now();
        let midnight = Utc
            .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
            .single()
            .unwrap_or(now);
        Period::trailing_months(midnight, self.period_months)
    }

    #[instrument(skip_all, fields(kind = %spec.kind, patient_id = %spec.patient_id, definition = %spec.definition_id))]
    pub async fn execute(&self, spec: &JobSpec) -> EngineResult<()> {
        match spec.kind {
            JobKind::Measure => self.run_measure(spec).await,
            JobKind::Rules => self.run_rules(spec).await,
            JobKind::Insights => self.run_insights(spec).await,
        }
    }

    async fn run_measure(&self, spec: &JobSpec) -> EngineResult<()> {
        let definition = self.registry.measure(&spec.definition_id)?;
        let period = self.reporting_period()?;
        let context = self.contexts.resolve(&spec.patient_id, spec.context_version).await?;

        let result = match self.measures.evaluate(&definition, &context, &period) {
            Err(e) if e.is_stale() => {
                info!(error = %e, "rebuilding stale context");
                let context = self.contexts.rebuild(&spec.patient_id, spec.context_version).await?;
                self.measures.evaluate(&definition, &context, &period)?
            }
            other => other?,
        };
        self.results.put_measure_result(&result).await?;
        Ok(())
    }

    async fn run_rules(&self, spec: &JobSpec) -> EngineResult<()> {
        let rule_set = self.registry.rule_set(&spec.definition_id)?;
        let context = self.contexts.resolve(&spec.patient_id, spec.context_version).await?;

        // Uncommitted keys are released if this future fails or is dropped
        // by the job timeout, so a retry emits them again.
        let mut opened = self.rules.open(&rule_set, &context)?;
        for key in opened.closed() {
            self.results.resolve_alert(key, self.clock.now()).await?;
            self.rules.resolve(key);
            info!(dedup_key = %key, "care gap closed");
        }
        while let Some(alert) = opened.next_uncommitted() {
            self.results.put_alert(alert).await?;
            opened.commit_next();
        }
        drop(opened);

        let score = self.risk.score(&context);
        self.results.put_risk_score(&score).await?;
        Ok(())
    }

    async fn run_insights(&self, spec: &JobSpec) -> EngineResult<()> {
        let narratives = self
            .narratives
            .as_ref()
            .ok_or_else(|| EngineError::invalid("insights", "no narrative service configured"))?;
        let context = self.contexts.resolve(&spec.patient_id, spec.context_version).await?;

        let gaps = self.open_gaps(&context)?;
        let completion = narratives.complete(&insight_prompt(&context, &gaps)).await?;
        let narrative = Narrative {
            patient_id: spec.patient_id.clone(),
            context_version: context.version(),
            text: completion.text,
            model: completion.model,
            generated_at: self.clock.now(),
        };
        self.results.put_narrative(&narrative).await?;
        Ok(())
    }

    fn open_gaps(&self, context: &PatientContext) -> EngineResult<Vec<crate::models::CareGapAlert>> {
        let mut gaps = Vec::new();
        for rule_set in self.registry.rule_sets() {
            gaps.extend(self.rules.fire(rule_set, context)?);
        }
        Ok(gaps)
    }
}

/// State shared by the scheduler and every lane worker.
pub(crate) struct Shared {
    pub store: Arc<dyn JobStore>,
    pub pipeline: Pipeline,
    pub clock: Arc<dyn Clock>,
    pub abandon_after: u32,
    /// Signalled whenever a job reaches a terminal status.
    pub progress: Notify,
}

/// One independent queue plus its worker group.
pub(crate) struct Lane {
    pub name: &'static str,
    pub tx: mpsc::Sender<JobId>,
    pub rx: Arc<Mutex<mpsc::Receiver<JobId>>>,
    pub workers: usize,
    pub retry: RetryPolicy,
    pub timeout: Duration,
}

impl Lane {
    pub fn new(name: &'static str, depth: usize, workers: usize, retry: RetryPolicy, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(depth.max(1));
        Self {
            name,
            tx,
            rx: Arc::new(Mutex::new(rx)),
            workers: workers.max(1),
            retry,
            timeout,
        }
    }

    pub fn spawn_workers(&self, shared: &Arc<Shared>, cancel: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|worker| {
                let rx = Arc::clone(&self.rx);
                let shared = Arc::clone(shared);
                let mut cancel = cancel.clone();
                let retry = self.retry;
                let timeout = self.timeout;
                let span = tracing::info_span!("worker", lane = self.name, worker);
                tokio::spawn(
                    async move {
                        loop {
                            if *cancel.borrow() {
                                break;
                            }
                            let next = tokio::select! {
                                biased;
                                changed = cancel.changed() => {
                                    if changed.is_err() {
                                        break;
                                    }
                                    continue;
                                }
                                next = async { rx.lock().await.recv().await } => next,
                            };
                            match next {
                                Some(id) => process(&shared, id, retry, timeout).await,
                                None => break,
                            }
                        }
                    }
                    .instrument(span),
                )
            })
            .collect()
    }
}

#[instrument(skip(shared, retry, timeout))]
async fn process(shared: &Arc<Shared>, id: JobId, retry: RetryPolicy, timeout: Duration) {
    let Some(job) = shared.store.claim(id, shared.clock.now()).await else {
        return;
    };
    let spec = job.spec;
    let attempts = AtomicU32::new(0);

    let outcome = RetryIf::start(
        retry.delays(),
        || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let shared = Arc::clone(shared);
            let spec = spec.clone();
            async move {
                let result = tokio::time::timeout(timeout, shared.pipeline.execute(&spec))
                    .await
                    .unwrap_or_else(|_| Err(EngineError::Timeout(timeout)));
                if let Err(e) = &result {
                    if e.is_transient() && attempt < retry.max_attempts {
                        warn!(attempt, error = %e, "transient failure, retrying");
                        shared.store.record_retry(id, e, shared.clock.now()).await;
                    }
                }
                result
            }
        },
        |e: &EngineError| e.is_transient(),
    )
    .await;

    let now = shared.clock.now();
    match outcome {
        Ok(()) => {
            shared.store.succeed(id, now).await;
            info!("job succeeded");
        }
        Err(e) => match shared.store.fail(id, &e, shared.abandon_after, now).await {
            JobStatus::Abandoned => error!(error = %e, "job abandoned until operator reset"),
            _ => warn!(error = %e, "job failed"),
        },
    }
    shared.progress.notify_waiters();
}
