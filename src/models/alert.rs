use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::card::Suggestion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Identity of an alert occurrence: rule, patient and the facts that triggered it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn new(rule_id: &str, patient_id: &str, evidence: &BTreeSet<String>) -> Self {
        let facts = evidence.iter().map(String::as_str).collect::<Vec<_>>().join(",");
        DedupKey(format!("{}|{}|{}", rule_id, patient_id, facts))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CareGapAlert {
    pub rule_id: String,
    pub patient_id: String,
    pub priority: i32,
    pub category: String,
    pub severity: Severity,
    pub message: String,
    pub generated_at: DateTime<Utc>,
    pub context_version: u64,
    pub dedup_key: DedupKey,
    /// Ids of the facts that made the rule condition true.
    pub evidence: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<Suggestion>,
    /// Set once the gap has closed; an open alert has none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl CareGapAlert {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}
