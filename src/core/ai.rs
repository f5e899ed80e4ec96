//! Narrative generation client.
//!
//! Insights jobs hand a formatted summary of a finished patient context to an
//! external language-model service and persist the text it returns. The
//! service speaks the OpenAI-compatible chat completions protocol.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, instrument};
use url::Url;

use crate::error::{EngineError, EngineResult};
use crate::models::{CareGapAlert, Fact, FactType, PatientContext};

const RECENT_VITALS: usize = 5;
const RECENT_ENCOUNTERS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub model: String,
}

#[async_trait]
pub trait NarrativeService: Send + Sync {
    async fn complete(&self, prompt: &str) -> EngineResult<Completion>;
}

pub struct HttpNarrativeService {
    client: Client,
    endpoint: Url,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
    temperature: f32,
}

impl HttpNarrativeService {
    pub fn new(endpoint: Url, model: impl Into<String>, api_key: Option<String>, timeout: Duration) -> EngineResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            model: model.into(),
            api_key,
            max_tokens: 512,
            temperature: 0.3,
        })
    }

    fn completions_url(&self) -> EngineResult<Url> {
        self.endpoint
            .join("v1/chat/completions")
            .map_err(|e| EngineError::narrative(format!("bad endpoint: {}", e), false))
    }
}

#[async_trait]
impl NarrativeService for HttpNarrativeService {
    #[instrument(skip_all, fields(model = %self.model))]
    async fn complete(&self, prompt: &str) -> EngineResult<Completion> {
        let mut request = self.client.post(self.completions_url()?).json(&json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "messages": [{ "role": "user", "content": prompt }],
        }));
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let retryable = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
            return Err(EngineError::narrative(format!("service answered {}", status), retryable));
        }

        let body: Value = response.json().await?;
        let text = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| EngineError::narrative("response carried no completion text", false))?;
        let model = body["model"].as_str().unwrap_or(&self.model).to_string();
        debug!(chars = text.len(), "narrative received");

        Ok(Completion {
            text: text.to_string(),
            model,
        })
    }
}

fn join_labels<'a>(facts: impl Iterator<Item = &'a Fact>) -> String {
    let labels: Vec<String> = facts
        .map(|f| match (f.value, f.unit.as_deref()) {
            (Some(v), Some(unit)) => format!("{} {} {}", f.label(), v, unit),
            (Some(v), None) => format!("{} {}", f.label(), v),
            _ => f.label().to_string(),
        })
        .collect();
    if labels.is_empty() {
        "None documented".to_string()
    } else {
        labels.join(", ")
    }
}

/// Plain-text clinical summary of a context and its open care gaps.
pub fn format_context(context: &PatientContext, gaps: &[CareGapAlert]) -> String {
    let active = |f: &&Fact| f.status.as_deref().map_or(true, |s| s.eq_ignore_ascii_case("active"));
    let conditions = join_labels(context.facts(&FactType::Condition).iter().filter(active));
    let medications = join_labels(context.facts(&FactType::Medication).iter().filter(active));
    let vitals = join_labels(context.facts(&FactType::Vital).iter().rev().take(RECENT_VITALS));
    let encounters = join_labels(context.facts(&FactType::Encounter).iter().rev().take(RECENT_ENCOUNTERS));
    let care_gaps = if gaps.is_empty() {
        "None".to_string()
    } else {
        gaps.iter().map(|g| g.message.as_str()).collect::<Vec<_>>().join("; ")
    };

    [
        format!("Active Conditions: {}", conditions),
        format!("Medications: {}", medications),
        format!("Recent Vitals: {}", vitals),
        format!("Open Care Gaps: {}", care_gaps),
        format!("Recent Encounters: {}", encounters),
    ]
    .join("\n")
}

pub fn insight_prompt(context: &PatientContext, gaps: &[CareGapAlert]) -> String {
    format!(
        "You are a population health clinical analyst. Review the clinical summary for patient {} \
         and provide prioritized recommendations for closing their care gaps.\n\n{}",
        context.patient_id(),
        format_context(context, gaps)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn service(uri: &str) -> HttpNarrativeService {
        HttpNarrativeService::new(
            Url::parse(uri).unwrap(),
            "llama3",
            Some("secret".into()),
            Duration::from_secs(2),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn returns_completion_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "llama3:8b",
                "choices": [{ "message": { "role": "assistant", "content": "Schedule an HbA1c." } }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let completion = service(&server.uri()).complete("summary").await.unwrap();
        assert_eq!(completion.text, "Schedule an HbA1c.");
        assert_eq!(completion.model, "llama3:8b");
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = service(&server.uri()).complete("summary").await.unwrap_err();
        assert!(matches!(err, EngineError::Narrative { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = service(&server.uri()).complete("summary").await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn empty_choices_are_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
            .mount(&server)
            .await;

        let err = service(&server.uri()).complete("summary").await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn summary_lists_each_section() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let ctx = PatientContext::assemble(
            "p1",
            1,
            at,
            None,
            vec![
                (FactType::Condition, Fact::new("c1", "E11.9", at).with_display("Type 2 diabetes")),
                (FactType::Condition, Fact::new("c2", "J45", at).with_status("resolved")),
                (FactType::Vital, Fact::new("v1", "8480-6", at).with_display("Systolic BP").with_value(142.0)),
            ],
        );
        let summary = format_context(&ctx, &[]);
        assert_eq!(
            summary,
            "Active Conditions: Type 2 diabetes\n\
             Medications: None documented\n\
             Recent Vitals: Systolic BP 142\n\
             Open Care Gaps: None\n\
             Recent Encounters: None documented"
        );
        assert!(insight_prompt(&ctx, &[]).contains("patient p1"));
    }
}
