mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use caregap::clock::Clock;
use caregap::core::InMemoryDataSource;
use caregap::db::{InMemoryResultStore, ResultStore};
use caregap::error::EngineResult;
use caregap::models::{
    CareGapAlert, DedupKey, JobKind, JobSpec, JobStatus, MeasureResult, Narrative, RiskScore,
};
use caregap::scheduler::{
    Backpressure, InMemoryJobStore, Pipeline, RetryPolicy, Scheduler, SchedulerConfig, SubmitOutcome,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;

use common::{a1c_measure, patient_a, patient_b, CannedNarratives, Harness, HarnessBuilder};

fn config() -> SchedulerConfig {
    SchedulerConfig {
        evaluation_workers: 2,
        insights_workers: 1,
        retry: RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1)),
        insights_retry: RetryPolicy::new(2, Duration::from_millis(100), Duration::from_secs(1)),
        ..SchedulerConfig::default()
    }
}

fn scheduler(harness: &Harness, config: SchedulerConfig) -> Arc<Scheduler> {
    scheduler_with(harness, harness.pipeline.clone(), config)
}

fn scheduler_with(harness: &Harness, pipeline: Pipeline, config: SchedulerConfig) -> Arc<Scheduler> {
    Arc::new(Scheduler::new(
        config,
        pipeline,
        Arc::new(InMemoryJobStore::new()),
        harness.clock.clone(),
    ))
}

/// Result store whose first alert write stalls for longer than a job may run.
struct StallingAlertStore {
    inner: Arc<InMemoryResultStore>,
    stall: Duration,
    stalled: AtomicBool,
}

#[async_trait]
impl ResultStore for StallingAlertStore {
    async fn put_measure_result(&self, result: &MeasureResult) -> EngineResult<bool> {
        self.inner.put_measure_result(result).await
    }

    async fn measure_results(&self, measure_id: &str, patient_id: &str) -> EngineResult<Vec<MeasureResult>> {
        self.inner.measure_results(measure_id, patient_id).await
    }

    async fn latest_measure_results(&self, measure_id: &str) -> EngineResult<Vec<MeasureResult>> {
        self.inner.latest_measure_results(measure_id).await
    }

    async fn put_alert(&self, alert: &CareGapAlert) -> EngineResult<bool> {
        if !self.stalled.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(self.stall).await;
        }
        self.inner.put_alert(alert).await
    }

    async fn resolve_alert(&self, key: &DedupKey, at: DateTime<Utc>) -> EngineResult<bool> {
        self.inner.resolve_alert(key, at).await
    }

    async fn alerts_for(&self, patient_id: &str) -> EngineResult<Vec<CareGapAlert>> {
        self.inner.alerts_for(patient_id).await
    }

    async fn put_risk_score(&self, score: &RiskScore) -> EngineResult<bool> {
        self.inner.put_risk_score(score).await
    }

    async fn latest_risk_score(&self, patient_id: &str) -> EngineResult<Option<RiskScore>> {
        self.inner.latest_risk_score(patient_id).await
    }

    async fn put_narrative(&self, narrative: &Narrative) -> EngineResult<bool> {
        self.inner.put_narrative(narrative).await
    }

    async fn latest_narrative(&self, patient_id: &str) -> EngineResult<Option<Narrative>> {
        self.inner.latest_narrative(patient_id).await
    }

    async fn prune_superseded(&self, keep: usize) -> EngineResult<usize> {
        self.inner.prune_superseded(keep).await
    }
}

#[tokio::test(start_paused = true)]
async fn transient_failures_retry_to_the_ceiling() {
    let harness = HarnessBuilder::new().measure(a1c_measure()).bundle(patient_a(1)).build();
    harness.source.set_unavailable("patient-a", true);
    let scheduler = scheduler(&harness, config());
    scheduler.start().await;

    let report = scheduler.run_nightly().await.unwrap();
    let summary = scheduler.wait_for_run(&report).await;
    assert_eq!(summary.failed, 1);

    let job = scheduler.job(report.jobs[0]).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
    assert!(job.last_error.unwrap().contains("unreachable"));
    assert_eq!(harness.source.fetch_count(), 3);
    assert_eq!(harness.results.measure_result_count(), 0);

    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn one_failing_patient_does_not_affect_others() {
    let harness = HarnessBuilder::new()
        .measure(a1c_measure())
        .bundle(patient_a(1))
        .bundle(patient_b(1))
        .build();
    harness.source.set_unavailable("patient-b", true);
    let scheduler = scheduler(&harness, config());
    scheduler.start().await;

    let report = scheduler.run_nightly().await.unwrap();
    let summary = scheduler.wait_for_run(&report).await;
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(
        harness.results.measure_results("a1c-control", "patient-a").await.unwrap().len(),
        1
    );

    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn sixth_consecutive_failure_abandons_until_reset() {
    let harness = HarnessBuilder::new().measure(a1c_measure()).bundle(patient_a(1)).build();
    harness.source.set_unavailable("patient-a", true);
    let scheduler = scheduler(
        &harness,
        SchedulerConfig {
            retry: RetryPolicy::new(1, Duration::from_millis(10), Duration::from_millis(10)),
            ..config()
        },
    );
    scheduler.start().await;

    for run in 1..=6 {
        let report = scheduler.run_nightly().await.unwrap();
        assert_eq!(report.jobs.len(), 1, "run {}", run);
        scheduler.wait_for_run(&report).await;
        let status = scheduler.job(report.jobs[0]).await.unwrap().status;
        let expected = if run < 6 { JobStatus::Failed } else { JobStatus::Abandoned };
        assert_eq!(status, expected, "run {}", run);
    }

    let excluded = scheduler.run_nightly().await.unwrap();
    assert!(excluded.jobs.is_empty());
    assert_eq!(excluded.abandoned, 1);

    let key = JobSpec::new(JobKind::Measure, "patient-a", "a1c-control", 1).stream_key();
    assert!(scheduler.reset(&key).await);
    harness.source.set_unavailable("patient-a", false);

    let report = scheduler.run_nightly().await.unwrap();
    assert_eq!(report.jobs.len(), 1);
    assert_eq!(scheduler.wait_for_run(&report).await.succeeded, 1);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn concurrent_duplicate_submissions_execute_once() {
    let source = InMemoryDataSource::new().with_latency(Duration::from_millis(20));
    source.put(patient_a(7));
    let harness = HarnessBuilder::new().measure(a1c_measure()).source(source).build();
    let scheduler = scheduler(&harness, config());
    scheduler.start().await;

    let spec = JobSpec::new(JobKind::Measure, "patient-a", "a1c-control", 7);
    let (first, second) = tokio::join!(scheduler.submit(spec.clone()), scheduler.submit(spec.clone()));
    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|o| matches!(o, SubmitOutcome::Created(_))).count(), 1);
    assert_eq!(outcomes.iter().filter(|o| matches!(o, SubmitOutcome::Duplicate(_))).count(), 1);
    assert_eq!(first.job_id(), second.job_id());

    let id = first.job_id().unwrap();
    loop {
        if scheduler.job(id).await.unwrap().status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(scheduler.job(id).await.unwrap().status, JobStatus::Succeeded);
    assert_eq!(harness.source.fetch_count(), 1);
    assert_eq!(harness.results.measure_result_count(), 1);
    assert_eq!(scheduler.submit(spec).await, SubmitOutcome::Duplicate(id));

    scheduler.shutdown().await;
}

#[tokio::test]
async fn full_queue_sheds_as_throttled() {
    let harness = HarnessBuilder::new().measure(a1c_measure()).bundle(patient_a(1)).build();
    let scheduler = scheduler(
        &harness,
        SchedulerConfig {
            queue_depth: 1,
            backpressure: Backpressure::Shed,
            ..config()
        },
    );
    // no workers: the queue never drains

    let first = scheduler.submit(JobSpec::new(JobKind::Measure, "patient-a", "a1c-control", 1)).await;
    assert!(matches!(first, SubmitOutcome::Created(_)));
    let second = scheduler.submit(JobSpec::new(JobKind::Measure, "patient-a", "a1c-control", 2)).await;
    let SubmitOutcome::Throttled(id) = second else {
        panic!("expected throttling, got {:?}", second);
    };
    assert_eq!(scheduler.job(id).await.unwrap().status, JobStatus::Throttled);
    assert_eq!(scheduler.jobs(Some(JobStatus::Throttled)).await.len(), 1);
    assert_eq!(scheduler.jobs(Some(JobStatus::Pending)).await.len(), 1);
}

#[tokio::test]
async fn cancelled_scheduler_leaves_new_jobs_pending() {
    let harness = HarnessBuilder::new().measure(a1c_measure()).bundle(patient_a(1)).build();
    let scheduler = scheduler(&harness, config());
    scheduler.start().await;
    scheduler.cancel();
    assert!(scheduler.is_cancelled());

    let id = scheduler
        .submit(JobSpec::new(JobKind::Measure, "patient-a", "a1c-control", 1))
        .await
        .job_id()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(scheduler.job(id).await.unwrap().status, JobStatus::Pending);

    scheduler.shutdown().await;
    assert_eq!(harness.results.measure_result_count(), 0);
}

#[tokio::test]
async fn stale_context_is_rebuilt_without_a_retry() {
    let harness = HarnessBuilder::new()
        .measure(a1c_measure())
        .bundle(patient_a(1))
        .staleness(ChronoDuration::hours(1))
        .build();
    harness.pipeline.contexts.resolve("patient-a", 1).await.unwrap();
    harness.clock.advance(ChronoDuration::hours(3));

    let scheduler = scheduler(&harness, config());
    scheduler.start().await;
    let report = scheduler.run_nightly().await.unwrap();
    assert_eq!(scheduler.wait_for_run(&report).await.succeeded, 1);

    let job = scheduler.job(report.jobs[0]).await.unwrap();
    assert_eq!(job.attempts, 1);
    assert_eq!(harness.source.fetch_count(), 2);
    let cached = harness.pipeline.contexts.cache().get("patient-a").unwrap();
    assert_eq!(cached.built_at(), harness.clock.now());

    scheduler.shutdown().await;
}

#[tokio::test]
async fn rules_jobs_persist_alerts_and_risk() {
    let harness = HarnessBuilder::new()
        .shipped_definitions()
        .bundle(patient_b(3))
        .build();
    let scheduler = scheduler(&harness, config());
    scheduler.start().await;

    let report = scheduler.run_nightly().await.unwrap();
    let summary = scheduler.wait_for_run(&report).await;
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.succeeded, report.jobs.len());

    // no A1c on file for patient B
    let alerts = harness.results.alerts_for("patient-b").await.unwrap();
    assert!(alerts.iter().any(|a| a.rule_id == "a1c-overdue"));
    let risk = harness.results.latest_risk_score("patient-b").await.unwrap().unwrap();
    assert_eq!(risk.context_version, 3);
    assert!((0.0..=100.0).contains(&risk.value));

    scheduler.shutdown().await;
}

#[tokio::test]
async fn insights_run_on_their_own_lane() {
    let harness = HarnessBuilder::new()
        .measure(a1c_measure())
        .bundle(patient_a(1))
        .bundle(patient_b(1))
        .narratives(Arc::new(CannedNarratives))
        .build();
    let scheduler = scheduler(
        &harness,
        SchedulerConfig {
            insights_enabled: true,
            ..config()
        },
    );
    scheduler.start().await;

    let report = scheduler.run_nightly().await.unwrap();
    assert_eq!(report.jobs.len(), 4);
    assert_eq!(scheduler.wait_for_run(&report).await.succeeded, 4);

    assert_eq!(harness.results.narrative_count(), 2);
    let narrative = harness.results.latest_narrative("patient-a").await.unwrap().unwrap();
    assert_eq!(narrative.model, "canned");
    assert!(narrative.text.starts_with("Summary"));

    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn alert_interrupted_by_the_job_timeout_is_emitted_on_retry() {
    let harness = HarnessBuilder::new().shipped_definitions().bundle(patient_b(1)).build();
    let mut pipeline = harness.pipeline.clone();
    pipeline.results = Arc::new(StallingAlertStore {
        inner: harness.results.clone(),
        stall: Duration::from_millis(500),
        stalled: AtomicBool::new(false),
    });
    let scheduler = scheduler_with(
        &harness,
        pipeline,
        SchedulerConfig {
            job_timeout_ms: 100,
            retry: RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(10)),
            ..config()
        },
    );
    scheduler.start().await;

    let report = scheduler.run_nightly().await.unwrap();
    let summary = scheduler.wait_for_run(&report).await;
    assert_eq!(summary.failed, 0);

    let rules_job = scheduler
        .jobs(None)
        .await
        .into_iter()
        .find(|j| j.spec.kind == JobKind::Rules)
        .unwrap();
    assert_eq!(rules_job.status, JobStatus::Succeeded);
    assert_eq!(rules_job.attempts, 2);

    let alerts = harness.results.alerts_for("patient-b").await.unwrap();
    let overdue = alerts.iter().find(|a| a.rule_id == "a1c-overdue").expect("a1c-overdue persisted");
    assert!(harness.pipeline.rules.ledger().is_open(&overdue.dedup_key));
    assert_eq!(harness.pipeline.rules.ledger().len(), alerts.len());

    scheduler.shutdown().await;
}

#[tokio::test]
async fn blocked_submit_returns_when_cancelled() {
    let harness = HarnessBuilder::new().measure(a1c_measure()).bundle(patient_a(1)).build();
    let scheduler = scheduler(
        &harness,
        SchedulerConfig {
            queue_depth: 1,
            backpressure: Backpressure::Block,
            ..config()
        },
    );
    // no workers: the first job fills the queue for good
    let first = scheduler.submit(JobSpec::new(JobKind::Measure, "patient-a", "a1c-control", 1)).await;
    assert!(matches!(first, SubmitOutcome::Created(_)));

    let blocked = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        async move {
            scheduler
                .submit(JobSpec::new(JobKind::Measure, "patient-a", "a1c-control", 2))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());

    scheduler.cancel();
    let second = tokio::time::timeout(Duration::from_secs(2), blocked)
        .await
        .expect("submit still blocked after cancel")
        .unwrap();
    let id = second.job_id().unwrap();
    assert_eq!(scheduler.job(id).await.unwrap().status, JobStatus::Pending);
}

#[tokio::test]
async fn nightly_run_after_cancel_does_not_hang() {
    let harness = HarnessBuilder::new()
        .measure(a1c_measure())
        .bundle(patient_a(1))
        .bundle(patient_b(1))
        .build();
    let scheduler = scheduler(
        &harness,
        SchedulerConfig {
            queue_depth: 1,
            backpressure: Backpressure::Block,
            ..config()
        },
    );
    scheduler.start().await;
    scheduler.cancel();

    let report = tokio::time::timeout(Duration::from_secs(2), scheduler.run_nightly())
        .await
        .expect("run_nightly blocked after cancel")
        .unwrap();
    assert_eq!(report.jobs.len(), 2);
    let summary = tokio::time::timeout(Duration::from_secs(2), scheduler.wait_for_run(&report))
        .await
        .expect("wait_for_run blocked after cancel");
    assert_eq!(summary.pending, 2);
    assert_eq!(summary.succeeded, 0);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn closed_gap_is_resolved_and_can_reopen() {
    let harness = HarnessBuilder::new().shipped_definitions().bundle(patient_b(1)).build();
    let scheduler = scheduler(&harness, config());
    scheduler.start().await;

    let overdue = |alerts: Vec<CareGapAlert>| -> Vec<CareGapAlert> {
        alerts.into_iter().filter(|a| a.rule_id == "a1c-overdue").collect()
    };

    let report = scheduler.run_nightly().await.unwrap();
    scheduler.wait_for_run(&report).await;
    let first = overdue(harness.results.alerts_for("patient-b").await.unwrap());
    assert_eq!(first.len(), 1);
    assert!(first[0].is_open());

    // a fresh A1c arrives with the next snapshot
    let mut tested = patient_b(2);
    tested.resources.push(json!({
        "resourceType": "Observation", "id": "b-a1c",
        "code": {"system": "http://loinc.org", "code": "4548-4"},
        "value": 7.0, "unit": "%", "effective": "2024-06-01T09:00:00Z"
    }));
    harness.source.put(tested);
    let report = scheduler.run_nightly().await.unwrap();
    assert_eq!(scheduler.wait_for_run(&report).await.failed, 0);
    let closed = overdue(harness.results.alerts_for("patient-b").await.unwrap());
    assert_eq!(closed.len(), 1);
    assert!(closed[0].resolved_at.is_some());
    assert!(!harness.pipeline.rules.ledger().is_open(&first[0].dedup_key));

    // the result is later withdrawn and the gap is back
    harness.source.put(patient_b(3));
    let report = scheduler.run_nightly().await.unwrap();
    scheduler.wait_for_run(&report).await;
    let reopened = overdue(harness.results.alerts_for("patient-b").await.unwrap());
    assert_eq!(reopened.len(), 2);
    assert!(reopened[0].resolved_at.is_some());
    assert!(reopened[1].is_open());
    assert_eq!(reopened[1].context_version, 3);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn operator_resolution_reopens_the_key() {
    let harness = HarnessBuilder::new().shipped_definitions().bundle(patient_b(1)).build();
    let scheduler = scheduler(&harness, config());
    scheduler.start().await;

    let report = scheduler.run_nightly().await.unwrap();
    scheduler.wait_for_run(&report).await;
    let alerts = harness.results.alerts_for("patient-b").await.unwrap();
    let key = alerts.iter().find(|a| a.rule_id == "a1c-overdue").unwrap().dedup_key.clone();

    assert!(scheduler.resolve_alert(&key).await.unwrap());
    assert!(!scheduler.resolve_alert(&key).await.unwrap());
    assert!(!harness.pipeline.rules.ledger().is_open(&key));

    // the gap still holds on the next snapshot, so it is raised again
    harness.source.put(patient_b(2));
    let report = scheduler.run_nightly().await.unwrap();
    scheduler.wait_for_run(&report).await;
    let raised: Vec<_> = harness
        .results
        .alerts_for("patient-b")
        .await
        .unwrap()
        .into_iter()
        .filter(|a| a.dedup_key == key)
        .collect();
    assert_eq!(raised.len(), 2);
    assert!(raised[1].is_open());

    scheduler.shutdown().await;
}
