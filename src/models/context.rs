use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Category of a clinical fact. Anything the source sends that is not one of
/// the well-known kinds is kept under `Other` so predicates can still name it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FactType {
    Condition,
    LabResult,
    Medication,
    Encounter,
    Vital,
    Procedure,
    Other(String),
}

impl FactType {
    pub fn as_str(&self) -> &str {
        match self {
            FactType::Condition => "condition",
            FactType::LabResult => "lab_result",
            FactType::Medication => "medication",
            FactType::Encounter => "encounter",
            FactType::Vital => "vital",
            FactType::Procedure => "procedure",
            FactType::Other(name) => name,
        }
    }
}

impl From<String> for FactType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "condition" => FactType::Condition,
            "lab_result" => FactType::LabResult,
            "medication" => FactType::Medication,
            "encounter" => FactType::Encounter,
            "vital" => FactType::Vital,
            "procedure" => FactType::Procedure,
            _ => FactType::Other(value),
        }
    }
}

impl From<&str> for FactType {
    fn from(value: &str) -> Self {
        FactType::from(value.to_string())
    }
}

impl From<FactType> for String {
    fn from(value: FactType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for FactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timestamped clinical observation, diagnosis, order or visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub abnormal: bool,
    pub effective_at: DateTime<Utc>,
}

impl Fact {
    pub fn new(id: impl Into<String>, code: impl Into<String>, effective_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            code: code.into(),
            system: None,
            display: None,
            value: None,
            unit: None,
            status: None,
            abnormal: false,
            effective_at,
        }
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }

    pub fn flagged_abnormal(mut self) -> Self {
        self.abnormal = true;
        self
    }

    /// Human readable label: display text when present, otherwise the code.
    pub fn label(&self) -> &str {
        self.display.as_deref().unwrap_or(&self.code)
    }
}

/// Normalized, versioned clinical snapshot of one patient.
///
/// Immutable once assembled: the context builder publishes a new snapshot
/// instead of touching an existing one, and every evaluator borrows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientContext {
    patient_id: String,
    version: u64,
    built_at: DateTime<Utc>,
    #[serde(default)]
    birth_date: Option<NaiveDate>,
    facts: BTreeMap<FactType, Vec<Fact>>,
}

impl PatientContext {
    /// Groups the facts by type and orders each sequence by effective time
    /// (ties broken by id, so two builds of the same bundle are identical).
    pub fn assemble(
        patient_id: impl Into<String>,
        version: u64,
        built_at: DateTime<Utc>,
        birth_date: Option<NaiveDate>,
        facts: impl IntoIterator<Item = (FactType, Fact)>,
    ) -> Self {
        let mut grouped: BTreeMap<FactType, Vec<Fact>> = BTreeMap::new();
        for (kind, fact) in facts {
            grouped.entry(kind).or_default().push(fact);
        }
        for seq in grouped.values_mut() {
            seq.sort_by(|a, b| a.effective_at.cmp(&b.effective_at).then_with(|| a.id.cmp(&b.id)));
        }

        Self {
            patient_id: patient_id.into(),
            version,
            built_at,
            birth_date,
            facts: grouped,
        }
    }

    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn birth_date(&self) -> Option<NaiveDate> {
        self.birth_date
    }

    /// Facts of one type in time order. Unknown types yield an empty slice.
    pub fn facts(&self, kind: &FactType) -> &[Fact] {
        self.facts.get(kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Facts with `start <= effective_at < end`, located by binary search so
    /// facts outside the window are never visited.
    pub fn facts_between(
        &self,
        kind: &FactType,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> &[Fact] {
        let seq = self.facts(kind);
        let lo = match start {
            Some(start) => seq.partition_point(|f| f.effective_at < start),
            None => 0,
        };
        let hi = match end {
            Some(end) => seq.partition_point(|f| f.effective_at < end),
            None => seq.len(),
        };
        if lo >= hi {
            &[]
        } else {
            &seq[lo..hi]
        }
    }

    /// Whether the source supplied this fact type at all (even as an empty list).
    pub fn has_type(&self, kind: &FactType) -> bool {
        self.facts.contains_key(kind)
    }

    pub fn fact_types(&self) -> impl Iterator<Item = &FactType> {
        self.facts.keys()
    }

    pub fn fact_count(&self) -> usize {
        self.facts.values().map(Vec::len).sum()
    }

    /// Seconds elapsed since the snapshot was built.
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.built_at).num_seconds()
    }

    pub fn age_years_at(&self, at: DateTime<Utc>) -> Option<u32> {
        let born = self.birth_date?;
        let today = at.date_naive();
        let mut years = today.year() - born.year();
        if (today.month(), today.day()) < (born.month(), born.day()) {
            years -= 1;
        }
        u32::try_from(years).ok()
    }
}
