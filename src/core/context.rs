//! Patient context assembly and caching.
//!
//! The [`ContextBuilder`] is the only producer of [`PatientContext`]
//! snapshots. Concurrent requests for the same patient and version share a
//! single build: the first caller spawns it and registers a completion
//! channel, later callers subscribe to that channel.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::core::data::{normalize_bundle, RawBundle};
use crate::core::registry::read_json_files;
use crate::error::{EngineError, EngineResult};
use crate::models::PatientContext;

/// Read-only clinical record source.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClinicalDataSource: Send + Sync {
    async fn active_patients(&self) -> EngineResult<Vec<String>>;

    /// Current snapshot version of the patient's record.
    async fn head_version(&self, patient_id: &str) -> EngineResult<u64>;

    async fn fetch_bundle(&self, patient_id: &str, version: u64) -> EngineResult<RawBundle>;
}

/// Versioned bundles held in memory. Used by the demo binary and by tests.
#[derive(Default)]
pub struct InMemoryDataSource {
    bundles: DashMap<String, BTreeMap<u64, RawBundle>>,
    unavailable: DashMap<String, ()>,
    latency: Option<Duration>,
    fetches: AtomicUsize,
}

impl InMemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch waits this long first.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Stores the bundle under its own version, which becomes the head when
    /// it is the highest seen for the patient.
    pub fn put(&self, bundle: RawBundle) {
        self.bundles
            .entry(bundle.patient_id.clone())
            .or_default()
            .insert(bundle.version, bundle);
    }

    /// Makes bundle fetches for the patient fail as unreachable. The head
    /// version stays readable.
    pub fn set_unavailable(&self, patient_id: &str, unavailable: bool) {
        if unavailable {
            self.unavailable.insert(patient_id.to_string(), ());
        } else {
            self.unavailable.remove(patient_id);
        }
    }

    /// Loads every `*.json` bundle in `dir`. A missing directory yields an
    /// empty source.
    pub fn load_dir(dir: impl AsRef<Path>) -> EngineResult<Self> {
        let dir = dir.as_ref();
        let source = Self::new();
        for raw in read_json_files(dir)? {
            let bundle: RawBundle = serde_json::from_str(&raw)
                .map_err(|e| EngineError::invalid(dir.display().to_string(), e.to_string()))?;
            source.put(bundle);
        }
        info!(patients = source.bundles.len(), dir = %dir.display(), "bundles loaded");
        Ok(source)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn check_available(&self, patient_id: &str) -> EngineResult<()> {
        if self.unavailable.contains_key(patient_id) {
            return Err(EngineError::DataSourceUnavailable(format!(
                "record for {} is unreachable",
                patient_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ClinicalDataSource for InMemoryDataSource {
    async fn active_patients(&self) -> EngineResult<Vec<String>> {
        let patients: BTreeSet<String> = self.bundles.iter().map(|e| e.key().clone()).collect();
        Ok(patients.into_iter().collect())
    }

    async fn head_version(&self, patient_id: &str) -> EngineResult<u64> {
        self.bundles
            .get(patient_id)
            .and_then(|versions| versions.keys().next_back().copied())
            .ok_or_else(|| EngineError::UnknownPatient(patient_id.to_string()))
    }

    async fn fetch_bundle(&self, patient_id: &str, version: u64) -> EngineResult<RawBundle> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.check_available(patient_id)?;
        let versions = self
            .bundles
            .get(patient_id)
            .ok_or_else(|| EngineError::UnknownPatient(patient_id.to_string()))?;
        versions.get(&version).cloned().ok_or_else(|| {
            EngineError::DataSourceUnavailable(format!("{} has no snapshot {}", patient_id, version))
        })
    }
}

/// Latest published snapshot per patient. Readers get a shared `Arc`;
/// writers replace it wholesale.
#[derive(Debug, Default)]
pub struct ContextCache {
    entries: DashMap<String, Arc<PatientContext>>,
}

impl ContextCache {
    pub fn get(&self, patient_id: &str) -> Option<Arc<PatientContext>> {
        self.entries.get(patient_id).map(|e| Arc::clone(e.value()))
    }

    pub fn get_version(&self, patient_id: &str, version: u64) -> Option<Arc<PatientContext>> {
        self.get(patient_id).filter(|ctx| ctx.version() == version)
    }

    /// Publishes unless a newer version is already cached.
    pub fn publish(&self, context: Arc<PatientContext>) -> bool {
        match self.entries.entry(context.patient_id().to_string()) {
            Entry::Occupied(mut slot) => {
                if slot.get().version() > context.version() {
                    return false;
                }
                slot.insert(context);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(context);
                true
            }
        }
    }

    pub fn invalidate(&self, patient_id: &str) -> bool {
        self.entries.remove(patient_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

type BuildOutcome = Option<Result<Arc<PatientContext>, EngineError>>;

pub struct ContextBuilder {
    source: Arc<dyn ClinicalDataSource>,
    cache: ContextCache,
    in_flight: DashMap<(String, u64), watch::Receiver<BuildOutcome>>,
    clock: Arc<dyn Clock>,
}

impl ContextBuilder {
    pub fn new(source: Arc<dyn ClinicalDataSource>, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            cache: ContextCache::default(),
            in_flight: DashMap::new(),
            clock,
        }
    }

    pub fn source(&self) -> &Arc<dyn ClinicalDataSource> {
        &self.source
    }

    pub fn cache(&self) -> &ContextCache {
        &self.cache
    }

    /// Cached context for `version`, building it once if absent.
    pub async fn resolve(self: &Arc<Self>, patient_id: &str, version: u64) -> EngineResult<Arc<PatientContext>> {
        if let Some(ctx) = self.cache.get_version(patient_id, version) {
            return Ok(ctx);
        }
        self.join_or_build(patient_id, version, false).await
    }

    /// Resolves the patient's current head version.
    pub async fn resolve_head(self: &Arc<Self>, patient_id: &str) -> EngineResult<Arc<PatientContext>> {
        let version = self.source.head_version(patient_id).await?;
        self.resolve(patient_id, version).await
    }

    /// Builds `version` again even if it is cached, e.g. after a staleness
    /// rejection. Still coalesced with any build already running.
    pub async fn rebuild(self: &Arc<Self>, patient_id: &str, version: u64) -> EngineResult<Arc<PatientContext>> {
        self.join_or_build(patient_id, version, true).await
    }

    /// The cached context if it was built within `ttl`.
    pub fn warm(&self, patient_id: &str, ttl: ChronoDuration) -> Option<Arc<PatientContext>> {
        let now = self.clock.now();
        self.cache
            .get(patient_id)
            .filter(|ctx| now - ctx.built_at() <= ttl)
    }

    /// Builds a context straight from a supplied bundle. The result is not
    /// cached: it reflects whatever the caller sent, not the source of record.
    pub fn build_from_bundle(&self, bundle: &RawBundle) -> Arc<PatientContext> {
        assemble(bundle, self.clock.as_ref())
    }

    pub fn invalidate(&self, patient_id: &str) -> bool {
        self.cache.invalidate(patient_id)
    }

    async fn join_or_build(
        self: &Arc<Self>,
        patient_id: &str,
        version: u64,
        force: bool,
    ) -> EngineResult<Arc<PatientContext>> {
        let key = (patient_id.to_string(), version);
        let mut rx = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(slot) => {
                debug!(patient_id, version, "joining in-flight context build");
                slot.get().clone()
            }
            Entry::Vacant(slot) => {
                if !force {
                    // a build may have finished between the cache check and here
                    if let Some(ctx) = self.cache.get_version(patient_id, version) {
                        return Ok(ctx);
                    }
                }
                let (tx, rx) = watch::channel(None);
                slot.insert(rx.clone());

                let builder = Arc::clone(self);
                tokio::spawn(async move {
                    let outcome = builder.build(&key.0, key.1).await;
                    if let Ok(ctx) = &outcome {
                        builder.cache.publish(Arc::clone(ctx));
                    }
                    builder.in_flight.remove(&key);
                    let _ = tx.send(Some(outcome));
                });
                rx
            }
        };

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| EngineError::DataSourceUnavailable("context build was aborted".to_string()))?;
        match &*outcome {
            Some(result) => result.clone(),
            None => Err(EngineError::DataSourceUnavailable("context build was aborted".to_string())),
        }
    }

    #[instrument(skip(self))]
    async fn build(&self, patient_id: &str, version: u64) -> EngineResult<Arc<PatientContext>> {
        let bundle = self.source.fetch_bundle(patient_id, version).await.map_err(|e| {
            warn!(error = %e, "context fetch failed");
            e
        })?;
        if bundle.patient_id != patient_id {
            return Err(EngineError::DataSourceUnavailable(format!(
                "source returned a bundle for {} when asked for {}",
                bundle.patient_id, patient_id
            )));
        }
        let ctx = assemble(&bundle, self.clock.as_ref());
        debug!(facts = ctx.fact_count(), "context built");
        Ok(ctx)
    }
}

fn assemble(bundle: &RawBundle, clock: &dyn Clock) -> Arc<PatientContext> {
    let normalized = normalize_bundle(bundle);
    Arc::new(PatientContext::assemble(
        bundle.patient_id.clone(),
        bundle.version,
        clock.now(),
        bundle.birth_date,
        normalized.facts,
    ))
}
