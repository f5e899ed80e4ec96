//! Quality-measure evaluation.
//!
//! A [`MeasureDefinition`] is loaded (and rejected if incomplete) once; the
//! [`MeasureEngine`] then evaluates it against patient contexts, walking the
//! population strata in their fixed order and skipping strata that can no
//! longer change the outcome.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::clock::Clock;
use crate::core::predicate::{Predicate, Scope};
use crate::error::{EngineError, EngineResult};
use crate::models::{MeasureResult, MeasureSummary, PatientContext, Period, PopulationFlags};

/// Measure definition as authored on disk. Every predicate is optional here so
/// that a missing one can be reported by name instead of as a parse error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasureDocument {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Care-gap category used when the measure is surfaced as a gap.
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub initial_population: Option<Predicate>,
    #[serde(default)]
    pub denominator: Option<Predicate>,
    #[serde(default)]
    pub denominator_exclusion: Option<Predicate>,
    #[serde(default)]
    pub denominator_exception: Option<Predicate>,
    #[serde(default)]
    pub numerator: Option<Predicate>,
}

/// A validated measure. Exclusion and exception strata are optional; the
/// other three are required.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasureDefinition {
    id: String,
    version: String,
    title: String,
    category: Option<String>,
    initial_population: Predicate,
    denominator: Predicate,
    exclusion: Option<Predicate>,
    exception: Option<Predicate>,
    numerator: Predicate,
}

impl MeasureDefinition {
    pub fn load(doc: MeasureDocument) -> EngineResult<Self> {
        if doc.id.trim().is_empty() {
            return Err(EngineError::invalid("<unnamed measure>", "measure id is empty"));
        }
        if doc.version.trim().is_empty() {
            return Err(EngineError::invalid(&doc.id, "measure version is empty"));
        }

        let id = doc.id;
        let require = |p: Option<Predicate>, stratum: &str| {
            p.ok_or_else(|| EngineError::invalid(&id, format!("missing required `{}` predicate", stratum)))
        };
        let initial_population = require(doc.initial_population, "initialPopulation")?;
        let denominator = require(doc.denominator, "denominator")?;
        let numerator = require(doc.numerator, "numerator")?;

        for p in [Some(&initial_population), Some(&denominator), doc.denominator_exclusion.as_ref(),
            doc.denominator_exception.as_ref(), Some(&numerator)]
            .into_iter()
            .flatten()
        {
            p.validate(&id)?;
        }

        Ok(Self {
            title: doc.title.unwrap_or_else(|| id.clone()),
            id,
            version: doc.version,
            category: doc.category,
            initial_population,
            denominator,
            exclusion: doc.denominator_exclusion,
            exception: doc.denominator_exception,
            numerator,
        })
    }

    pub fn from_json(raw: &str) -> EngineResult<Self> {
        let doc: MeasureDocument = serde_json::from_str(raw)
            .map_err(|e| EngineError::invalid("<measure document>", e.to_string()))?;
        Self::load(doc)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }
}

pub struct MeasureEngine {
    clock: Arc<dyn Clock>,
    staleness: Duration,
}

impl MeasureEngine {
    pub fn new(clock: Arc<dyn Clock>, staleness: Duration) -> Self {
        Self { clock, staleness }
    }

    #[instrument(
        skip_all,
        fields(measure = %definition.id(), patient_id = %context.patient_id(), version = context.version())
    )]
    pub fn evaluate(
        &self,
        definition: &MeasureDefinition,
        context: &PatientContext,
        period: &Period,
    ) -> EngineResult<MeasureResult> {
        let now = self.clock.now();
        let age = now - context.built_at();
        if age > self.staleness {
            return Err(EngineError::StaleContext {
                patient_id: context.patient_id().to_string(),
                version: context.version(),
                age_secs: age.num_seconds(),
            });
        }

        let scope = Scope::new(context, *period);
        let mut flags = PopulationFlags {
            initial_population: definition.initial_population.is_satisfied(&scope),
            ..Default::default()
        };
        if flags.initial_population {
            flags.denominator = definition.denominator.is_satisfied(&scope);
        }
        if flags.denominator {
            flags.excluded = definition.exclusion.as_ref().is_some_and(|p| p.is_satisfied(&scope));
            if !flags.excluded {
                flags.exception = definition.exception.as_ref().is_some_and(|p| p.is_satisfied(&scope));
            }
            if flags.in_performance_denominator() {
                flags.numerator = definition.numerator.is_satisfied(&scope);
            }
        }

        let score = flags
            .in_performance_denominator()
            .then(|| if flags.numerator { 1.0 } else { 0.0 });

        debug!(?flags, "measure evaluated");

        Ok(MeasureResult {
            measure_id: definition.id.clone(),
            measure_version: definition.version.clone(),
            patient_id: context.patient_id().to_string(),
            context_version: context.version(),
            flags,
            score,
            evaluated_at: now,
        })
    }

    /// Rolls patient results up into one summary per measure version.
    pub fn summarize<'a>(results: impl IntoIterator<Item = &'a MeasureResult>) -> Vec<MeasureSummary> {
        let mut summaries: BTreeMap<(String, String), MeasureSummary> = BTreeMap::new();
        for result in results {
            summaries
                .entry((result.measure_id.clone(), result.measure_version.clone()))
                .or_insert_with(|| MeasureSummary::empty(&result.measure_id, &result.measure_version))
                .add(&result.flags);
        }
        summaries.into_values().collect()
    }
}
