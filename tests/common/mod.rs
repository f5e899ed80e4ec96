#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use caregap::clock::ManualClock;
use caregap::core::ai::{Completion, NarrativeService};
use caregap::core::measure::MeasureDefinition;
use caregap::core::{
    ContextBuilder, DefinitionRegistry, InMemoryDataSource, MeasureEngine, RawBundle, RiskModelConfig,
    RiskScoringModule, RulesEngine,
};
use caregap::db::InMemoryResultStore;
use caregap::error::EngineResult;
use caregap::scheduler::Pipeline;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde_json::json;

/// 2024-06-15 14:00 UTC; every scenario runs at this instant unless it moves the clock.
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 15, 14, 0, 0).unwrap()
}

pub fn definitions_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("definitions")
}

pub fn a1c_measure() -> MeasureDefinition {
    let raw = std::fs::read_to_string(definitions_dir().join("measures/a1c-control.json")).unwrap();
    MeasureDefinition::from_json(&raw).unwrap()
}

/// Diabetes with an A1c of 7.2 two months ago.
pub fn patient_a(version: u64) -> RawBundle {
    let mut bundle = RawBundle::new("patient-a", version);
    bundle.resources = vec![
        json!({"resourceType": "Condition", "id": "a-dm", "code": "E11.9", "status": "active",
               "effective": "2019-05-02T00:00:00Z"}),
        json!({"resourceType": "Observation", "id": "a-a1c",
               "code": {"system": "http://loinc.org", "code": "4548-4", "display": "Hemoglobin A1c"},
               "value": 7.2, "unit": "%", "effective": "2024-04-15T09:00:00Z"}),
    ];
    bundle
}

/// Diabetes and a hospice encounter.
pub fn patient_b(version: u64) -> RawBundle {
    let mut bundle = RawBundle::new("patient-b", version);
    bundle.resources = vec![
        json!({"resourceType": "Condition", "id": "b-dm", "code": "E11.65", "status": "active",
               "effective": "2012-03-20T00:00:00Z"}),
        json!({"resourceType": "Encounter", "id": "b-hospice", "code": "hospice",
               "effective": "2024-05-01T00:00:00Z"}),
    ];
    bundle
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub source: Arc<InMemoryDataSource>,
    pub results: Arc<InMemoryResultStore>,
    pub pipeline: Pipeline,
}

pub struct HarnessBuilder {
    source: InMemoryDataSource,
    registry: DefinitionRegistry,
    staleness: ChronoDuration,
    narratives: Option<Arc<dyn NarrativeService>>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            source: InMemoryDataSource::new(),
            registry: DefinitionRegistry::new(),
            staleness: ChronoDuration::hours(24),
            narratives: None,
        }
    }

    /// Every definition shipped under `definitions/`.
    pub fn shipped_definitions(mut self) -> Self {
        self.registry = DefinitionRegistry::load_dir(definitions_dir()).unwrap();
        self
    }

    pub fn measure(mut self, definition: MeasureDefinition) -> Self {
        self.registry.add_measure(definition).unwrap();
        self
    }

    pub fn bundle(self, bundle: RawBundle) -> Self {
        self.source.put(bundle);
        self
    }

    pub fn source(mut self, source: InMemoryDataSource) -> Self {
        self.source = source;
        self
    }

    pub fn staleness(mut self, staleness: ChronoDuration) -> Self {
        self.staleness = staleness;
        self
    }

    pub fn narratives(mut self, service: Arc<dyn NarrativeService>) -> Self {
        self.narratives = Some(service);
        self
    }

    pub fn build(self) -> Harness {
        let clock = Arc::new(ManualClock::new(now()));
        let source = Arc::new(self.source);
        let results = Arc::new(InMemoryResultStore::new());
        let pipeline = Pipeline {
            registry: Arc::new(self.registry),
            contexts: Arc::new(ContextBuilder::new(source.clone(), clock.clone())),
            measures: Arc::new(MeasureEngine::new(clock.clone(), self.staleness)),
            rules: Arc::new(RulesEngine::new(clock.clone())),
            risk: Arc::new(RiskScoringModule::new(RiskModelConfig::default(), clock.clone()).unwrap()),
            results: results.clone(),
            narratives: self.narratives,
            clock: clock.clone(),
            period_months: 12,
        };
        Harness {
            clock,
            source,
            results,
            pipeline,
        }
    }
}

/// Narrative service that answers every prompt with a fixed text.
pub struct CannedNarratives;

#[async_trait]
impl NarrativeService for CannedNarratives {
    async fn complete(&self, prompt: &str) -> EngineResult<Completion> {
        Ok(Completion {
            text: format!("Summary ({} prompt chars)", prompt.len()),
            model: "canned".to_string(),
        })
    }
}
