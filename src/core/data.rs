//! Normalization of raw clinical resource bundles into typed facts.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::models::{Fact, FactType};

/// Resource bundle as served by a clinical data source or carried in a
/// decision-support prefetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBundle {
    pub patient_id: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<NaiveDate>,
    #[serde(default)]
    pub resources: Vec<Value>,
}

impl RawBundle {
    pub fn new(patient_id: impl Into<String>, version: u64) -> Self {
        Self {
            patient_id: patient_id.into(),
            version,
            birth_date: None,
            resources: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct Normalized {
    pub facts: Vec<(FactType, Fact)>,
    pub skipped: usize,
}

/// Maps every well-formed resource to a fact. Malformed resources are logged
/// and skipped.
pub fn normalize_bundle(bundle: &RawBundle) -> Normalized {
    let mut facts = Vec::with_capacity(bundle.resources.len());
    let mut skipped = 0;

    for (index, resource) in bundle.resources.iter().enumerate() {
        match normalize_resource(resource) {
            Ok(fact) => facts.push(fact),
            Err(reason) => {
                skipped += 1;
                warn!(
                    patient_id = %bundle.patient_id,
                    index,
                    reason,
                    "skipping malformed resource"
                );
            }
        }
    }

    Normalized { facts, skipped }
}

fn fact_type_of(resource: &Value, resource_type: &str) -> FactType {
    match resource_type {
        "Condition" => FactType::Condition,
        "Observation" => {
            if resource.get("category").and_then(Value::as_str) == Some("vital-signs") {
                FactType::Vital
            } else {
                FactType::LabResult
            }
        }
        "MedicationRequest" | "MedicationStatement" => FactType::Medication,
        "Encounter" => FactType::Encounter,
        "Procedure" => FactType::Procedure,
        other => FactType::Other(other.to_string()),
    }
}

fn normalize_resource(resource: &Value) -> Result<(FactType, Fact), &'static str> {
    let resource_type = resource
        .get("resourceType")
        .and_then(Value::as_str)
        .ok_or("missing resourceType")?;
    let id = resource
        .get("id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or("missing id")?;

    let (code, system, display) = match resource.get("code") {
        Some(Value::String(code)) => (code.clone(), None, None),
        Some(Value::Object(coding)) => {
            let code = coding
                .get("code")
                .and_then(Value::as_str)
                .ok_or("code object without code")?;
            let text = |key: &str| coding.get(key).and_then(Value::as_str).map(str::to_string);
            (code.to_string(), text("system"), text("display"))
        }
        _ => return Err("missing code"),
    };
    if code.is_empty() {
        return Err("empty code");
    }

    let effective_at = resource
        .get("effective")
        .and_then(Value::as_str)
        .ok_or("missing effective time")?;
    let effective_at = DateTime::parse_from_rfc3339(effective_at)
        .map_err(|_| "effective time is not RFC 3339")?
        .with_timezone(&Utc);

    let value = match resource.get("value") {
        None | Some(Value::Null) => None,
        Some(v) => Some(v.as_f64().ok_or("non-numeric value")?),
    };

    let fact = Fact {
        id: id.to_string(),
        code,
        system,
        display,
        value,
        unit: resource.get("unit").and_then(Value::as_str).map(str::to_string),
        status: resource.get("status").and_then(Value::as_str).map(str::to_string),
        abnormal: resource.get("abnormal").and_then(Value::as_bool).unwrap_or(false),
        effective_at,
    };

    Ok((fact_type_of(resource, resource_type), fact))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bundle(resources: Vec<Value>) -> RawBundle {
        RawBundle {
            patient_id: "p1".into(),
            version: 4,
            birth_date: None,
            resources,
        }
    }

    #[test]
    fn maps_resource_types() {
        let normalized = normalize_bundle(&bundle(vec![
            json!({"resourceType": "Condition", "id": "c1", "code": "E11.9", "effective": "2023-01-01T00:00:00Z", "status": "active"}),
            json!({"resourceType": "Observation", "id": "o1", "category": "vital-signs",
                   "code": {"system": "http://loinc.org", "code": "8480-6", "display": "Systolic BP"},
                   "effective": "2024-01-01T10:00:00+02:00", "value": 150, "unit": "mmHg"}),
            json!({"resourceType": "Observation", "id": "o2", "code": "4548-4", "effective": "2024-02-01T00:00:00Z", "value": 7.1, "abnormal": true}),
            json!({"resourceType": "MedicationRequest", "id": "m1", "code": "860975", "effective": "2024-02-01T00:00:00Z"}),
            json!({"resourceType": "ImagingStudy", "id": "i1", "code": "CT", "effective": "2024-02-01T00:00:00Z"}),
        ]));

        assert_eq!(normalized.skipped, 0);
        let kinds: Vec<_> = normalized.facts.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                FactType::Condition,
                FactType::Vital,
                FactType::LabResult,
                FactType::Medication,
                FactType::Other("ImagingStudy".into()),
            ]
        );

        let (_, vital) = &normalized.facts[1];
        assert_eq!(vital.system.as_deref(), Some("http://loinc.org"));
        assert_eq!(vital.value, Some(150.0));
        assert_eq!(vital.effective_at.to_rfc3339(), "2024-01-01T08:00:00+00:00");
        assert!(normalized.facts[2].1.abnormal);
    }

    #[test]
    fn skips_malformed_resources() {
        let normalized = normalize_bundle(&bundle(vec![
            json!({"id": "x1", "code": "a", "effective": "2024-01-01T00:00:00Z"}),
            json!({"resourceType": "Condition", "code": "a", "effective": "2024-01-01T00:00:00Z"}),
            json!({"resourceType": "Condition", "id": "x3", "effective": "2024-01-01T00:00:00Z"}),
            json!({"resourceType": "Condition", "id": "x4", "code": "a", "effective": "yesterday"}),
            json!({"resourceType": "Observation", "id": "x5", "code": "a", "effective": "2024-01-01T00:00:00Z", "value": "high"}),
            json!({"resourceType": "Condition", "id": "ok", "code": "a", "effective": "2024-01-01T00:00:00Z"}),
        ]));
        assert_eq!(normalized.skipped, 5);
        assert_eq!(normalized.facts.len(), 1);
        assert_eq!(normalized.facts[0].1.id, "ok");
    }

    #[test]
    fn parses_bundle_document() {
        let raw = r#"{"patientId": "p9", "version": 12, "birthDate": "1950-03-04", "resources": []}"#;
        let parsed: RawBundle = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.version, 12);
        assert_eq!(parsed.birth_date, NaiveDate::from_ymd_opt(1950, 3, 4));
    }
}
