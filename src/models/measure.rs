use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Reporting period, closed at the start and open at the end: `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Period {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> EngineResult<Self> {
        if start >= end {
            return Err(EngineError::invalid(
                "period",
                format!("start {} is not before end {}", start, end),
            ));
        }
        Ok(Self { start, end })
    }

    /// The `months` long period ending (exclusively) at `end`.
    pub fn trailing_months(end: DateTime<Utc>, months: u32) -> EngineResult<Self> {
        let start = end
            .checked_sub_months(Months::new(months))
            .ok_or_else(|| EngineError::invalid("period", "trailing window underflows"))?;
        Self::new(start, end)
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

/// Population membership of one patient for one measure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PopulationFlags {
    pub initial_population: bool,
    pub denominator: bool,
    pub excluded: bool,
    pub exception: bool,
    pub numerator: bool,
}

impl PopulationFlags {
    /// In the denominator and not carved out by an exclusion or exception.
    pub fn in_performance_denominator(&self) -> bool {
        self.denominator && !self.excluded && !self.exception
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeasureResultKey {
    pub measure_id: String,
    pub measure_version: String,
    pub patient_id: String,
    pub context_version: u64,
}

/// Immutable outcome of evaluating one measure for one patient context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasureResult {
    pub measure_id: String,
    pub measure_version: String,
    pub patient_id: String,
    pub context_version: u64,
    pub flags: PopulationFlags,
    /// 1.0 when the numerator is met, 0.0 when the patient counts against
    /// performance, absent when the patient is outside the performance denominator.
    pub score: Option<f64>,
    pub evaluated_at: DateTime<Utc>,
}

impl MeasureResult {
    pub fn key(&self) -> MeasureResultKey {
        MeasureResultKey {
            measure_id: self.measure_id.clone(),
            measure_version: self.measure_version.clone(),
            patient_id: self.patient_id.clone(),
            context_version: self.context_version,
        }
    }
}

/// Population-level roll-up of patient results for one measure version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasureSummary {
    pub measure_id: String,
    pub measure_version: String,
    pub initial_population: usize,
    pub denominator: usize,
    pub excluded: usize,
    pub exception: usize,
    pub numerator: usize,
    /// Percentage rounded to one decimal place.
    pub performance_rate: Option<f64>,
}

impl MeasureSummary {
    pub fn empty(measure_id: impl Into<String>, measure_version: impl Into<String>) -> Self {
        Self {
            measure_id: measure_id.into(),
            measure_version: measure_version.into(),
            initial_population: 0,
            denominator: 0,
            excluded: 0,
            exception: 0,
            numerator: 0,
            performance_rate: None,
        }
    }

    pub fn add(&mut self, flags: &PopulationFlags) {
        self.initial_population += usize::from(flags.initial_population);
        self.denominator += usize::from(flags.denominator);
        self.excluded += usize::from(flags.excluded);
        self.exception += usize::from(flags.exception);
        self.numerator += usize::from(flags.numerator);

        let eligible = self.denominator.saturating_sub(self.excluded + self.exception);
        self.performance_rate = if eligible == 0 {
            None
        } else {
            let rate = self.numerator as f64 / eligible as f64 * 100.0;
            Some((rate * 10.0).round() / 10.0)
        };
    }
}
