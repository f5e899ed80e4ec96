//! Result persistence.
//!
//! Every record written here is immutable and keyed; a second write of the
//! same key is ignored rather than overwriting the first. Alerts are the one
//! exception: an open alert can be marked resolved, after which its key may
//! be written again.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::EngineResult;
use crate::models::{CareGapAlert, DedupKey, MeasureResult, MeasureResultKey, Narrative, RiskScore};

pub mod sqlite;

pub use sqlite::SqliteResultStore;

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// False when a result with the same key already exists.
    async fn put_measure_result(&self, result: &MeasureResult) -> EngineResult<bool>;

    /// Results for one measure and patient, oldest context version first.
    async fn measure_results(&self, measure_id: &str, patient_id: &str) -> EngineResult<Vec<MeasureResult>>;

    /// The newest result per patient for one measure.
    async fn latest_measure_results(&self, measure_id: &str) -> EngineResult<Vec<MeasureResult>>;

    /// False when an open alert with the same dedup key already exists.
    async fn put_alert(&self, alert: &CareGapAlert) -> EngineResult<bool>;

    /// Marks the open alert with this key resolved. False when none is open.
    async fn resolve_alert(&self, key: &DedupKey, at: DateTime<Utc>) -> EngineResult<bool>;

    /// Open and resolved alerts, priority descending, then rule id, then
    /// oldest occurrence first.
    async fn alerts_for(&self, patient_id: &str) -> EngineResult<Vec<CareGapAlert>>;

    async fn put_risk_score(&self, score: &RiskScore) -> EngineResult<bool>;

    async fn latest_risk_score(&self, patient_id: &str) -> EngineResult<Option<RiskScore>>;

    async fn put_narrative(&self, narrative: &Narrative) -> EngineResult<bool>;

    async fn latest_narrative(&self, patient_id: &str) -> EngineResult<Option<Narrative>>;

    /// Keeps the newest `keep` context versions of each (measure, patient)
    /// and returns how many results were removed.
    async fn prune_superseded(&self, keep: usize) -> EngineResult<usize>;
}

#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    measure_results: DashMap<MeasureResultKey, MeasureResult>,
    /// Every occurrence per key, oldest first; only the last may be open.
    alerts: DashMap<DedupKey, Vec<CareGapAlert>>,
    risk_scores: DashMap<(String, u64, String), RiskScore>,
    narratives: DashMap<(String, u64), Narrative>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn measure_result_count(&self) -> usize {
        self.measure_results.len()
    }

    pub fn alert_count(&self) -> usize {
        self.alerts.iter().map(|e| e.len()).sum()
    }

    pub fn risk_score_count(&self) -> usize {
        self.risk_scores.len()
    }

    pub fn narrative_count(&self) -> usize {
        self.narratives.len()
    }
}

fn insert_if_absent<K, V>(map: &DashMap<K, V>, key: K, value: &V) -> bool
where
    K: std::hash::Hash + Eq,
    V: Clone,
{
    match map.entry(key) {
        dashmap::mapref::entry::Entry::Occupied(_) => false,
        dashmap::mapref::entry::Entry::Vacant(slot) => {
            slot.insert(value.clone());
            true
        }
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn put_measure_result(&self, result: &MeasureResult) -> EngineResult<bool> {
        Ok(insert_if_absent(&self.measure_results, result.key(), result))
    }

    async fn measure_results(&self, measure_id: &str, patient_id: &str) -> EngineResult<Vec<MeasureResult>> {
        let mut results: Vec<MeasureResult> = self
            .measure_results
            .iter()
            .filter(|e| e.measure_id == measure_id && e.patient_id == patient_id)
            .map(|e| e.value().clone())
            .collect();
        results.sort_by(|a, b| {
            a.context_version
                .cmp(&b.context_version)
                .then_with(|| a.measure_version.cmp(&b.measure_version))
        });
        Ok(results)
    }

    async fn latest_measure_results(&self, measure_id: &str) -> EngineResult<Vec<MeasureResult>> {
        let mut latest: HashMap<String, MeasureResult> = HashMap::new();
        for entry in self.measure_results.iter().filter(|e| e.measure_id == measure_id) {
            let newer = latest
                .get(&entry.patient_id)
                .map_or(true, |current| entry.context_version > current.context_version);
            if newer {
                latest.insert(entry.patient_id.clone(), entry.value().clone());
            }
        }
        let mut results: Vec<MeasureResult> = latest.into_values().collect();
        results.sort_by(|a, b| a.patient_id.cmp(&b.patient_id));
        Ok(results)
    }

    async fn put_alert(&self, alert: &CareGapAlert) -> EngineResult<bool> {
        let mut occurrences = self.alerts.entry(alert.dedup_key.clone()).or_default();
        if occurrences.last().is_some_and(CareGapAlert::is_open) {
            return Ok(false);
        }
        occurrences.push(alert.clone());
        Ok(true)
    }

    async fn resolve_alert(&self, key: &DedupKey, at: DateTime<Utc>) -> EngineResult<bool> {
        let Some(mut occurrences) = self.alerts.get_mut(key) else {
            return Ok(false);
        };
        match occurrences.last_mut() {
            Some(open) if open.is_open() => {
                open.resolved_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn alerts_for(&self, patient_id: &str) -> EngineResult<Vec<CareGapAlert>> {
        let mut alerts: Vec<CareGapAlert> = self
            .alerts
            .iter()
            .flat_map(|e| e.value().clone())
            .filter(|a| a.patient_id == patient_id)
            .collect();
        alerts.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.rule_id.cmp(&b.rule_id))
                .then_with(|| a.dedup_key.cmp(&b.dedup_key))
        });
        Ok(alerts)
    }

    async fn put_risk_score(&self, score: &RiskScore) -> EngineResult<bool> {
        let key = (score.patient_id.clone(), score.context_version, score.model_version.clone());
        Ok(insert_if_absent(&self.risk_scores, key, score))
    }

    async fn latest_risk_score(&self, patient_id: &str) -> EngineResult<Option<RiskScore>> {
        Ok(self
            .risk_scores
            .iter()
            .filter(|e| e.patient_id == patient_id)
            .max_by(|a, b| {
                a.context_version
                    .cmp(&b.context_version)
                    .then_with(|| a.computed_at.cmp(&b.computed_at))
            })
            .map(|e| e.value().clone()))
    }

    async fn put_narrative(&self, narrative: &Narrative) -> EngineResult<bool> {
        let key = (narrative.patient_id.clone(), narrative.context_version);
        Ok(insert_if_absent(&self.narratives, key, narrative))
    }

    async fn latest_narrative(&self, patient_id: &str) -> EngineResult<Option<Narrative>> {
        Ok(self
            .narratives
            .iter()
            .filter(|e| e.patient_id == patient_id)
            .max_by_key(|e| e.context_version)
            .map(|e| e.value().clone()))
    }

    async fn prune_superseded(&self, keep: usize) -> EngineResult<usize> {
        let mut versions: HashMap<(String, String), Vec<u64>> = HashMap::new();
        for entry in self.measure_results.iter() {
            versions
                .entry((entry.measure_id.clone(), entry.patient_id.clone()))
                .or_default()
                .push(entry.context_version);
        }
        for list in versions.values_mut() {
            list.sort_unstable_by(|a, b| b.cmp(a));
            list.dedup();
        }

        let doomed: Vec<MeasureResultKey> = self
            .measure_results
            .iter()
            .filter(|e| {
                versions
                    .get(&(e.measure_id.clone(), e.patient_id.clone()))
                    .and_then(|list| list.get(keep))
                    .is_some_and(|&cutoff| e.context_version <= cutoff)
            })
            .map(|e| e.key().clone())
            .collect();

        for key in &doomed {
            self.measure_results.remove(key);
        }
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PopulationFlags;
    use chrono::{TimeZone, Utc};

    fn result(patient: &str, version: u64) -> MeasureResult {
        MeasureResult {
            measure_id: "a1c-control".into(),
            measure_version: "2024.1".into(),
            patient_id: patient.into(),
            context_version: version,
            flags: PopulationFlags {
                initial_population: true,
                denominator: true,
                ..Default::default()
            },
            score: Some(0.0),
            evaluated_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn results_are_never_overwritten() {
        let store = InMemoryResultStore::new();
        assert!(store.put_measure_result(&result("p1", 1)).await.unwrap());

        let mut changed = result("p1", 1);
        changed.score = Some(1.0);
        assert!(!store.put_measure_result(&changed).await.unwrap());

        let stored = store.measure_results("a1c-control", "p1").await.unwrap();
        assert_eq!(stored, vec![result("p1", 1)]);
    }

    #[tokio::test]
    async fn resolved_alert_key_can_be_written_again() {
        use crate::models::Severity;

        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let alert = CareGapAlert {
            rule_id: "bp-uncontrolled".into(),
            patient_id: "p1".into(),
            priority: 20,
            category: "chronic-disease".into(),
            severity: Severity::Critical,
            message: "BP above goal".into(),
            generated_at: at,
            context_version: 1,
            dedup_key: DedupKey::new("bp-uncontrolled", "p1", &Default::default()),
            evidence: Vec::new(),
            suggestion: None,
            resolved_at: None,
        };
        let store = InMemoryResultStore::new();
        assert!(store.put_alert(&alert).await.unwrap());
        assert!(!store.put_alert(&alert).await.unwrap());
        assert!(store.resolve_alert(&alert.dedup_key, at).await.unwrap());
        assert!(!store.resolve_alert(&alert.dedup_key, at).await.unwrap());
        assert!(store.put_alert(&alert).await.unwrap());

        let stored = store.alerts_for("p1").await.unwrap();
        assert_eq!(store.alert_count(), 2);
        assert_eq!(stored[0].resolved_at, Some(at));
        assert!(stored[1].is_open());
    }

    #[tokio::test]
    async fn latest_picks_newest_version_per_patient() {
        let store = InMemoryResultStore::new();
        for (p, v) in [("p1", 1), ("p1", 3), ("p2", 2)] {
            store.put_measure_result(&result(p, v)).await.unwrap();
        }
        let latest = store.latest_measure_results("a1c-control").await.unwrap();
        let keys: Vec<_> = latest.iter().map(|r| (r.patient_id.as_str(), r.context_version)).collect();
        assert_eq!(keys, vec![("p1", 3), ("p2", 2)]);
    }

    #[tokio::test]
    async fn prune_keeps_newest_versions() {
        let store = InMemoryResultStore::new();
        for v in 1..=5 {
            store.put_measure_result(&result("p1", v)).await.unwrap();
        }
        store.put_measure_result(&result("p2", 1)).await.unwrap();

        assert_eq!(store.prune_superseded(2).await.unwrap(), 3);
        let left: Vec<u64> = store
            .measure_results("a1c-control", "p1")
            .await
            .unwrap()
            .iter()
            .map(|r| r.context_version)
            .collect();
        assert_eq!(left, vec![4, 5]);
        assert_eq!(store.measure_results("a1c-control", "p2").await.unwrap().len(), 1);
    }
}
