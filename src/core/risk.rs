//! Composite patient risk scoring.
//!
//! A risk model is a versioned set of named factor weights summing to one.
//! Each named factor is computed by a [`FactorExtractor`] returning a
//! sub-score in `[0, 100]`; factors whose input data is missing from the
//! context contribute nothing and are reported as unavailable.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    Fact, FactType, FactorContribution, FactorStatus, PatientContext, RiskBand, RiskScore,
};

const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskModelConfig {
    pub version: String,
    /// Factor name to weight.
    pub factors: BTreeMap<String, f64>,
}

impl Default for RiskModelConfig {
    fn default() -> Self {
        let factors = [
            ("age", 0.20),
            ("condition_burden", 0.20),
            ("vital_abnormalities", 0.15),
            ("lab_abnormalities", 0.15),
            ("encounter_frequency", 0.15),
            ("medication_complexity", 0.15),
        ]
        .into_iter()
        .map(|(name, w)| (name.to_string(), w))
        .collect();
        Self {
            version: "phm-2024.1".to_string(),
            factors,
        }
    }
}

/// Output of one extractor.
#[derive(Debug, Clone, PartialEq)]
pub struct FactorReading {
    pub sub_score: f64,
    pub detail: String,
}

pub trait FactorExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` when the context lacks the data this factor needs.
    fn extract(&self, context: &PatientContext, as_of: DateTime<Utc>) -> Option<FactorReading>;
}

/// Maps a raw count onto points using descending `(at_least, points)` tiers,
/// then rescales the points to `[0, 100]` against `max_points`.
fn tiered(value: usize, tiers: &[(usize, f64)], max_points: f64) -> f64 {
    let points = tiers
        .iter()
        .find(|(at_least, _)| value >= *at_least)
        .map(|(_, p)| *p)
        .unwrap_or(0.0);
    points / max_points * 100.0
}

fn is_active(fact: &Fact) -> bool {
    fact.status.as_deref().map_or(true, |s| s.eq_ignore_ascii_case("active"))
}

pub struct AgeFactor;

impl FactorExtractor for AgeFactor {
    fn name(&self) -> &'static str {
        "age"
    }

    fn extract(&self, context: &PatientContext, as_of: DateTime<Utc>) -> Option<FactorReading> {
        let age = context.age_years_at(as_of)?;
        let points = match age {
            80.. => 20.0,
            65..=79 => 15.0,
            50..=64 => 10.0,
            0..=1 => 12.0,
            _ => 0.0,
        };
        Some(FactorReading {
            sub_score: points / 20.0 * 100.0,
            detail: format!("Age {} years", age),
        })
    }
}

pub struct ConditionBurdenFactor;

impl FactorExtractor for ConditionBurdenFactor {
    fn name(&self) -> &'static str {
        "condition_burden"
    }

    fn extract(&self, context: &PatientContext, _as_of: DateTime<Utc>) -> Option<FactorReading> {
        if !context.has_type(&FactType::Condition) {
            return None;
        }
        let active = context.facts(&FactType::Condition).iter().filter(|f| is_active(f)).count();
        Some(FactorReading {
            sub_score: tiered(active, &[(5, 25.0), (3, 18.0), (2, 12.0), (1, 6.0)], 25.0),
            detail: format!("{} active conditions", active),
        })
    }
}

pub struct VitalAbnormalitiesFactor;

impl VitalAbnormalitiesFactor {
    const RECENT_READINGS: usize = 10;

    fn points(fact: &Fact) -> f64 {
        let Some(value) = fact.value else {
            return 0.0;
        };
        match fact.code.as_str() {
            "systolic_bp" | "8480-6" if value >= 180.0 => 10.0,
            "systolic_bp" | "8480-6" if value >= 140.0 => 5.0,
            "bmi" | "39156-5" if value >= 40.0 || value < 16.0 => 5.0,
            "heart_rate" | "8867-4" if value > 120.0 || value < 50.0 => 5.0,
            _ => 0.0,
        }
    }
}

impl FactorExtractor for VitalAbnormalitiesFactor {
    fn name(&self) -> &'static str {
        "vital_abnormalities"
    }

    fn extract(&self, context: &PatientContext, as_of: DateTime<Utc>) -> Option<FactorReading> {
        if !context.has_type(&FactType::Vital) {
            return None;
        }
        let recent: Vec<&Fact> = context
            .facts_between(&FactType::Vital, None, Some(as_of))
            .iter()
            .rev()
            .take(Self::RECENT_READINGS)
            .collect();
        let points: f64 = recent.iter().map(|f| Self::points(f)).sum();
        Some(FactorReading {
            sub_score: points.min(20.0) / 20.0 * 100.0,
            detail: format!("{} recent vital readings analyzed", recent.len()),
        })
    }
}

pub struct LabAbnormalitiesFactor;

impl FactorExtractor for LabAbnormalitiesFactor {
    fn name(&self) -> &'static str {
        "lab_abnormalities"
    }

    fn extract(&self, context: &PatientContext, as_of: DateTime<Utc>) -> Option<FactorReading> {
        if !context.has_type(&FactType::LabResult) {
            return None;
        }
        let since = as_of.checked_sub_months(Months::new(6));
        let abnormal = context
            .facts_between(&FactType::LabResult, since, Some(as_of))
            .iter()
            .filter(|f| f.abnormal)
            .count();
        Some(FactorReading {
            sub_score: tiered(abnormal, &[(5, 20.0), (3, 12.0), (1, 5.0)], 20.0),
            detail: format!("{} abnormal results in 6 months", abnormal),
        })
    }
}

pub struct EncounterFrequencyFactor;

impl FactorExtractor for EncounterFrequencyFactor {
    fn name(&self) -> &'static str {
        "encounter_frequency"
    }

    fn extract(&self, context: &PatientContext, as_of: DateTime<Utc>) -> Option<FactorReading> {
        if !context.has_type(&FactType::Encounter) {
            return None;
        }
        let since = as_of - Duration::days(365);
        let count = context
            .facts_between(&FactType::Encounter, Some(since), Some(as_of))
            .len();
        // both no contact and heavy utilization signal risk
        let points = match count {
            0 => 10.0,
            12.. => 15.0,
            8..=11 => 8.0,
            _ => 0.0,
        };
        Some(FactorReading {
            sub_score: points / 15.0 * 100.0,
            detail: format!("{} encounters in 12 months", count),
        })
    }
}

pub struct MedicationComplexityFactor;

impl FactorExtractor for MedicationComplexityFactor {
    fn name(&self) -> &'static str {
        "medication_complexity"
    }

    fn extract(&self, context: &PatientContext, _as_of: DateTime<Utc>) -> Option<FactorReading> {
        if !context.has_type(&FactType::Medication) {
            return None;
        }
        let active = context.facts(&FactType::Medication).iter().filter(|f| is_active(f)).count();
        Some(FactorReading {
            sub_score: tiered(active, &[(10, 15.0), (5, 8.0), (3, 3.0)], 15.0),
            detail: format!("{} active medications", active),
        })
    }
}

pub fn builtin_extractor(name: &str) -> Option<Arc<dyn FactorExtractor>> {
    let extractor: Arc<dyn FactorExtractor> = match name {
        "age" => Arc::new(AgeFactor),
        "condition_burden" => Arc::new(ConditionBurdenFactor),
        "vital_abnormalities" => Arc::new(VitalAbnormalitiesFactor),
        "lab_abnormalities" => Arc::new(LabAbnormalitiesFactor),
        "encounter_frequency" => Arc::new(EncounterFrequencyFactor),
        "medication_complexity" => Arc::new(MedicationComplexityFactor),
        _ => return None,
    };
    Some(extractor)
}

pub struct RiskScoringModule {
    version: String,
    factors: Vec<(Arc<dyn FactorExtractor>, f64)>,
    clock: Arc<dyn Clock>,
}

impl RiskScoringModule {
    /// Validates the model against the built-in extractors.
    pub fn new(config: RiskModelConfig, clock: Arc<dyn Clock>) -> EngineResult<Self> {
        Self::with_extractors(config, clock, builtin_extractor)
    }

    pub fn with_extractors<F>(config: RiskModelConfig, clock: Arc<dyn Clock>, lookup: F) -> EngineResult<Self>
    where
        F: Fn(&str) -> Option<Arc<dyn FactorExtractor>>,
    {
        let owner = format!("risk model {}", config.version);
        if config.factors.is_empty() {
            return Err(EngineError::invalid(owner, "no factors configured"));
        }

        let mut factors = Vec::with_capacity(config.factors.len());
        for (name, &weight) in &config.factors {
            if !weight.is_finite() || weight < 0.0 {
                return Err(EngineError::invalid(
                    owner,
                    format!("factor `{}` has invalid weight {}", name, weight),
                ));
            }
            let extractor = lookup(name)
                .ok_or_else(|| EngineError::invalid(&owner, format!("unknown factor `{}`", name)))?;
            factors.push((extractor, weight));
        }

        let total: f64 = config.factors.values().sum();
        if (total - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(EngineError::invalid(
                owner,
                format!("factor weights sum to {}, expected 1.0", total),
            ));
        }

        Ok(Self {
            version: config.version,
            factors,
            clock,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    #[instrument(skip_all, fields(patient_id = %context.patient_id(), model = %self.version))]
    pub fn score(&self, context: &PatientContext) -> RiskScore {
        let now = self.clock.now();

        let factors: Vec<FactorContribution> = self
            .factors
            .iter()
            .map(|(extractor, weight)| match extractor.extract(context, now) {
                Some(reading) if reading.sub_score.is_finite() => {
                    let sub_score = reading.sub_score.clamp(0.0, 100.0);
                    FactorContribution {
                        name: extractor.name().to_string(),
                        weight: *weight,
                        sub_score,
                        contribution: weight * sub_score,
                        status: FactorStatus::Available,
                        detail: reading.detail,
                    }
                }
                Some(reading) => {
                    warn!(factor = extractor.name(), sub_score = reading.sub_score, "non-finite factor score ignored");
                    FactorContribution {
                        name: extractor.name().to_string(),
                        weight: *weight,
                        sub_score: 0.0,
                        contribution: 0.0,
                        status: FactorStatus::Unavailable,
                        detail: "non-finite sub-score".to_string(),
                    }
                }
                None => FactorContribution {
                    name: extractor.name().to_string(),
                    weight: *weight,
                    sub_score: 0.0,
                    contribution: 0.0,
                    status: FactorStatus::Unavailable,
                    detail: "no data".to_string(),
                },
            })
            .collect();

        let raw_value: f64 = factors.iter().map(|f| f.contribution).sum();
        let value = raw_value.clamp(0.0, 100.0);
        let band = RiskBand::from_score(value);
        debug!(value, band = band.as_str(), "risk scored");

        RiskScore {
            patient_id: context.patient_id().to_string(),
            context_version: context.version(),
            model_version: self.version.clone(),
            value,
            raw_value,
            band,
            factors,
            computed_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{NaiveDate, TimeZone};
    use test_case::test_case;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn module() -> RiskScoringModule {
        RiskScoringModule::new(RiskModelConfig::default(), Arc::new(ManualClock::new(now()))).unwrap()
    }

    fn days_ago(d: i64) -> DateTime<Utc> {
        now() - Duration::days(d)
    }

    #[test]
    fn empty_context_marks_everything_unavailable() {
        let ctx = PatientContext::assemble("p1", 1, now(), None, Vec::new());
        let score = module().score(&ctx);
        assert_eq!(score.value, 0.0);
        assert_eq!(score.band, RiskBand::Low);
        assert!(score.factors.iter().all(|f| f.status == FactorStatus::Unavailable));
        assert_eq!(score.factors.len(), 6);
    }

    #[test]
    fn multimorbid_elderly_patient_scores_high() {
        let mut facts = Vec::new();
        for i in 0..5 {
            facts.push((FactType::Condition, Fact::new(format!("c{}", i), format!("I{}", i), days_ago(900))));
        }
        for i in 0..10 {
            facts.push((FactType::Medication, Fact::new(format!("m{}", i), format!("rx{}", i), days_ago(60))));
        }
        for i in 0..5 {
            facts.push((
                FactType::LabResult,
                Fact::new(format!("l{}", i), "2160-0", days_ago(20 + i)).with_value(2.1).flagged_abnormal(),
            ));
        }
        facts.push((FactType::Vital, Fact::new("v1", "systolic_bp", days_ago(3)).with_value(185.0)));
        facts.push((FactType::Vital, Fact::new("v2", "heart_rate", days_ago(3)).with_value(130.0)));
        facts.push((FactType::Vital, Fact::new("v3", "bmi", days_ago(3)).with_value(41.0)));
        for i in 0..12 {
            facts.push((FactType::Encounter, Fact::new(format!("e{}", i), "visit", days_ago(10 + i * 20))));
        }
        let birth = NaiveDate::from_ymd_opt(1940, 1, 1);
        let ctx = PatientContext::assemble("p1", 1, now(), birth, facts);

        let score = module().score(&ctx);
        assert!((score.value - 100.0).abs() < 1e-9);
        assert_eq!(score.band, RiskBand::Critical);
        assert!(score.factors.iter().all(|f| f.status == FactorStatus::Available));
    }

    #[test]
    fn missing_encounters_do_not_count_as_zero_visits() {
        let ctx = PatientContext::assemble(
            "p1",
            1,
            now(),
            None,
            vec![(FactType::Condition, Fact::new("c1", "E11.9", days_ago(30)))],
        );
        let score = module().score(&ctx);
        let encounters = score.factors.iter().find(|f| f.name == "encounter_frequency").unwrap();
        assert_eq!(encounters.status, FactorStatus::Unavailable);
        assert_eq!(encounters.contribution, 0.0);
    }

    #[test]
    fn inactive_conditions_are_ignored() {
        let ctx = PatientContext::assemble(
            "p1",
            1,
            now(),
            None,
            vec![
                (FactType::Condition, Fact::new("c1", "E11.9", days_ago(30))),
                (FactType::Condition, Fact::new("c2", "J45", days_ago(30)).with_status("resolved")),
            ],
        );
        let burden = ConditionBurdenFactor.extract(&ctx, now()).unwrap();
        assert_eq!(burden.sub_score, 6.0 / 25.0 * 100.0);
        assert_eq!(burden.detail, "1 active conditions");
    }

    #[test_case(1940 => 100.0 ; "over eighty")]
    #[test_case(1955 => 75.0 ; "over sixty five")]
    #[test_case(1970 => 50.0 ; "over fifty")]
    #[test_case(1990 => 0.0 ; "adult")]
    #[test_case(2023 => 60.0 ; "infant")]
    fn age_tiers(birth_year: i32) -> f64 {
        let ctx = PatientContext::assemble(
            "p1",
            1,
            now(),
            NaiveDate::from_ymd_opt(birth_year, 1, 1),
            Vec::new(),
        );
        AgeFactor.extract(&ctx, now()).unwrap().sub_score
    }

    #[test]
    fn rejects_weights_not_summing_to_one() {
        let mut config = RiskModelConfig::default();
        config.factors.insert("age".into(), 0.5);
        let err = RiskScoringModule::new(config, Arc::new(ManualClock::new(now()))).err().unwrap();
        assert!(matches!(err, EngineError::InvalidDefinition { .. }));
    }

    #[test]
    fn rejects_unknown_factor() {
        let config = RiskModelConfig {
            version: "x".into(),
            factors: [("zodiac".to_string(), 1.0)].into_iter().collect(),
        };
        assert!(RiskScoringModule::new(config, Arc::new(ManualClock::new(now()))).is_err());
    }

    struct Constant(f64);

    impl FactorExtractor for Constant {
        fn name(&self) -> &'static str {
            "constant"
        }

        fn extract(&self, _: &PatientContext, _: DateTime<Utc>) -> Option<FactorReading> {
            Some(FactorReading {
                sub_score: self.0,
                detail: String::new(),
            })
        }
    }

    fn constant_module(sub_score: f64) -> RiskScoringModule {
        let config = RiskModelConfig {
            version: "custom".into(),
            factors: [("constant".to_string(), 1.0)].into_iter().collect(),
        };
        RiskScoringModule::with_extractors(config, Arc::new(ManualClock::new(now())), move |name| {
            (name == "constant").then(|| Arc::new(Constant(sub_score)) as Arc<dyn FactorExtractor>)
        })
        .unwrap()
    }

    #[test]
    fn value_stays_within_bounds() {
        let score = constant_module(250.0).score(&PatientContext::assemble("p1", 1, now(), None, Vec::new()));
        assert!((0.0..=100.0).contains(&score.value));
        assert_eq!(score.value, 100.0);
    }

    #[test_case(f64::NAN ; "nan")]
    #[test_case(f64::INFINITY ; "infinite")]
    fn non_finite_sub_scores_are_unavailable(sub_score: f64) {
        let score = constant_module(sub_score).score(&PatientContext::assemble("p1", 1, now(), None, Vec::new()));
        assert_eq!(score.value, 0.0);
        assert_eq!(score.raw_value, 0.0);
        assert_eq!(score.factors[0].status, FactorStatus::Unavailable);
    }
}
