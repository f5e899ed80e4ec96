use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-text narrative produced by the insights collaborator for one context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Narrative {
    pub patient_id: String,
    pub context_version: u64,
    pub text: String,
    pub model: String,
    pub generated_at: DateTime<Utc>,
}
