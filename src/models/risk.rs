use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskBand {
    Low,
    Moderate,
    High,
    Critical,
}

impl RiskBand {
    pub fn from_score(score: f64) -> Self {
        if score >= 75.0 {
            RiskBand::Critical
        } else if score >= 50.0 {
            RiskBand::High
        } else if score >= 25.0 {
            RiskBand::Moderate
        } else {
            RiskBand::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskBand::Low => "low",
            RiskBand::Moderate => "moderate",
            RiskBand::High => "high",
            RiskBand::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactorStatus {
    Available,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactorContribution {
    pub name: String,
    pub weight: f64,
    /// Factor sub-score in [0, 100].
    pub sub_score: f64,
    /// `weight * sub_score`.
    pub contribution: f64,
    pub status: FactorStatus,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskScore {
    pub patient_id: String,
    pub context_version: u64,
    pub model_version: String,
    /// Composite score clamped to [0, 100].
    pub value: f64,
    pub raw_value: f64,
    pub band: RiskBand,
    pub factors: Vec<FactorContribution>,
    pub computed_at: DateTime<Utc>,
}
