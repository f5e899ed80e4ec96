//! Real-time decision support: hook discovery and invocation.
//!
//! An invocation moves through `Received → ContextResolved → Evaluated →
//! Responded`. Evaluation runs on its own task and races a deadline; when the
//! deadline wins the caller gets an empty card set and the late result is
//! dropped.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::core::{ContextBuilder, DefinitionRegistry, RawBundle, RiskScoringModule, RulesEngine};
use crate::error::EngineResult;
use crate::models::card::{CardAction, CardSource, CardSuggestion};
use crate::models::{CareGapAlert, CdsCard, HookResponse, Indicator, PatientContext, RiskBand, RiskScore};

const SUMMARY_LIMIT: usize = 140;

/// Prefetch key under which a caller may send the patient's resource bundle.
pub const PREFETCH_BUNDLE_KEY: &str = "bundle";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookService {
    pub id: String,
    pub hook: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub prefetch: BTreeMap<String, String>,
    /// Rule sets evaluated for this service. Empty means every loaded set.
    #[serde(default, skip_serializing)]
    pub rule_sets: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CdsConfig {
    pub budget_ms: u64,
    pub catalog_version: String,
    pub source_label: String,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub services: Vec<HookService>,
}

impl CdsConfig {
    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }
}

impl Default for CdsConfig {
    fn default() -> Self {
        let prefetch = [(PREFETCH_BUNDLE_KEY.to_string(), "Bundle?patient={{context.patientId}}".to_string())]
            .into_iter()
            .collect();
        Self {
            budget_ms: 500,
            catalog_version: "2024.1".to_string(),
            source_label: "Care Gap Engine".to_string(),
            source_url: None,
            services: vec![HookService {
                id: "care-gaps".to_string(),
                hook: "order-sign".to_string(),
                title: "Care Gap Recommendations".to_string(),
                description: "Surfaces open care gaps and suggests orders that close them.".to_string(),
                prefetch,
                rule_sets: Vec::new(),
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Discovery {
    pub version: String,
    pub services: Vec<HookService>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookContext {
    #[serde(default)]
    pub patient_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub draft_orders: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookRequest {
    pub hook: String,
    pub hook_instance: String,
    #[serde(default)]
    pub context: HookContext,
    #[serde(default)]
    pub prefetch: BTreeMap<String, Value>,
}

impl HookRequest {
    fn prefetch_bundle(&self, patient_id: &str) -> Option<RawBundle> {
        let raw = self.prefetch.get(PREFETCH_BUNDLE_KEY)?;
        match serde_json::from_value::<RawBundle>(raw.clone()) {
            Ok(bundle) if bundle.patient_id == patient_id => Some(bundle),
            Ok(bundle) => {
                warn!(expected = patient_id, got = %bundle.patient_id, "prefetch bundle is for another patient");
                None
            }
            Err(e) => {
                warn!(error = %e, "ignoring malformed prefetch bundle");
                None
            }
        }
    }

    /// Codes of every coding in the draft orders.
    fn draft_order_codes(&self) -> HashSet<String> {
        let mut codes = HashSet::new();
        let Some(entries) = self
            .context
            .draft_orders
            .as_ref()
            .and_then(|orders| orders.get("entry"))
            .and_then(Value::as_array)
        else {
            return codes;
        };
        for entry in entries {
            let codings = entry
                .pointer("/resource/code/coding")
                .and_then(Value::as_array)
                .into_iter()
                .flatten();
            for coding in codings {
                if let Some(code) = coding.get("code").and_then(Value::as_str) {
                    codes.insert(code.to_string());
                }
            }
        }
        codes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Received,
    ContextResolved,
    Evaluated,
    Responded,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HookOutcome {
    pub phase: HookPhase,
    pub response: HookResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookRejection {
    #[error("unknown service `{0}`")]
    UnknownService(String),
    #[error("service `{service}` handles `{expected}` hooks, got `{got}`")]
    WrongHook {
        service: String,
        expected: String,
        got: String,
    },
}

/// What the real-time path computed for one context.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub alerts: Vec<CareGapAlert>,
    pub risk: Option<RiskScore>,
}

/// Context resolution and evaluation behind the adapter.
#[async_trait]
pub trait RealtimeEvaluator: Send + Sync {
    async fn resolve(&self, patient_id: &str, prefetch: Option<RawBundle>) -> EngineResult<Arc<PatientContext>>;

    fn evaluate(&self, rule_sets: &[String], context: &PatientContext) -> EngineResult<Evaluation>;
}

/// Evaluates with the batch engines, without touching the alert ledger.
pub struct EngineEvaluator {
    contexts: Arc<ContextBuilder>,
    registry: Arc<DefinitionRegistry>,
    rules: Arc<RulesEngine>,
    risk: Arc<RiskScoringModule>,
    warm_ttl: ChronoDuration,
}

impl EngineEvaluator {
    pub fn new(
        contexts: Arc<ContextBuilder>,
        registry: Arc<DefinitionRegistry>,
        rules: Arc<RulesEngine>,
        risk: Arc<RiskScoringModule>,
        warm_ttl: ChronoDuration,
    ) -> Self {
        Self {
            contexts,
            registry,
            rules,
            risk,
            warm_ttl,
        }
    }
}

#[async_trait]
impl RealtimeEvaluator for EngineEvaluator {
    async fn resolve(&self, patient_id: &str, prefetch: Option<RawBundle>) -> EngineResult<Arc<PatientContext>> {
        if let Some(ctx) = self.contexts.warm(patient_id, self.warm_ttl) {
            debug!(patient_id, version = ctx.version(), "using warm context");
            return Ok(ctx);
        }
        if let Some(bundle) = prefetch {
            debug!(patient_id, "building context from prefetch");
            return Ok(self.contexts.build_from_bundle(&bundle));
        }
        self.contexts.resolve_head(patient_id).await
    }

    fn evaluate(&self, rule_sets: &[String], context: &PatientContext) -> EngineResult<Evaluation> {
        let mut alerts = Vec::new();
        if rule_sets.is_empty() {
            for set in self.registry.rule_sets() {
                alerts.extend(self.rules.fire(set, context)?);
            }
        } else {
            for id in rule_sets {
                let set = self.registry.rule_set(id)?;
                alerts.extend(self.rules.fire(&set, context)?);
            }
        }
        alerts.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.rule_id.cmp(&b.rule_id)));

        Ok(Evaluation {
            alerts,
            risk: Some(self.risk.score(context)),
        })
    }
}

pub struct DecisionSupportAdapter {
    config: CdsConfig,
    evaluator: Arc<dyn RealtimeEvaluator>,
}

impl DecisionSupportAdapter {
    pub fn new(config: CdsConfig, evaluator: Arc<dyn RealtimeEvaluator>) -> Self {
        Self { config, evaluator }
    }

    pub fn discovery(&self) -> Discovery {
        Discovery {
            version: self.config.catalog_version.clone(),
            services: self.config.services.clone(),
        }
    }

    /// Handles one hook call. Rejections are protocol errors; everything
    /// else, internal failures included, yields a (possibly empty) card set.
    #[instrument(skip_all, fields(service = service_id, hook_instance = %request.hook_instance))]
    pub async fn invoke(&self, service_id: &str, request: HookRequest) -> Result<HookOutcome, HookRejection> {
        let service = self
            .config
            .services
            .iter()
            .find(|s| s.id == service_id)
            .ok_or_else(|| HookRejection::UnknownService(service_id.to_string()))?;
        if service.hook != request.hook {
            return Err(HookRejection::WrongHook {
                service: service.id.clone(),
                expected: service.hook.clone(),
                got: request.hook.clone(),
            });
        }

        let Some(patient_id) = request.context.patient_id.clone() else {
            debug!("no patient in hook context");
            return Ok(HookOutcome {
                phase: HookPhase::Responded,
                response: HookResponse::default(),
            });
        };

        let (phase_tx, phase_rx) = watch::channel(HookPhase::Received);
        let evaluator = Arc::clone(&self.evaluator);
        let rule_sets = service.rule_sets.clone();
        let prefetch = request.prefetch_bundle(&patient_id);
        let task = tokio::spawn(async move {
            let context = evaluator.resolve(&patient_id, prefetch).await?;
            phase_tx.send_replace(HookPhase::ContextResolved);
            let evaluation = evaluator.evaluate(&rule_sets, &context)?;
            phase_tx.send_replace(HookPhase::Evaluated);
            Ok::<_, crate::error::EngineError>(evaluation)
        });
        let abort = task.abort_handle();

        let budget = self.config.budget();
        tokio::select! {
            joined = task => {
                let cards = match joined {
                    Ok(Ok(evaluation)) => self.cards(&request, &evaluation),
                    Ok(Err(e)) => {
                        warn!(error = %e, "evaluation failed, responding without cards");
                        Vec::new()
                    }
                    Err(e) => {
                        error!(error = %e, "evaluation task failed");
                        Vec::new()
                    }
                };
                info!(cards = cards.len(), "hook responded");
                Ok(HookOutcome {
                    phase: HookPhase::Responded,
                    response: HookResponse { cards },
                })
            }
            _ = tokio::time::sleep(budget) => {
                abort.abort();
                let reached = *phase_rx.borrow();
                warn!(budget_ms = budget.as_millis() as u64, ?reached, "hook timed out");
                Ok(HookOutcome {
                    phase: HookPhase::TimedOut,
                    response: HookResponse::default(),
                })
            }
        }
    }

    fn cards(&self, request: &HookRequest, evaluation: &Evaluation) -> Vec<CdsCard> {
        let drafted = request.draft_order_codes();
        let mut cards: Vec<CdsCard> = evaluation
            .alerts
            .iter()
            .map(|alert| self.alert_card(request, alert, &drafted))
            .collect();
        if let Some(score) = evaluation.risk.as_ref().filter(|s| s.band >= RiskBand::High) {
            cards.push(self.risk_card(request, score));
        }
        cards
    }

    fn source(&self) -> CardSource {
        CardSource {
            label: self.config.source_label.clone(),
            url: self.config.source_url.clone(),
        }
    }

    fn alert_card(&self, request: &HookRequest, alert: &CareGapAlert, drafted: &HashSet<String>) -> CdsCard {
        let suggestions = alert
            .suggestion
            .as_ref()
            .filter(|s| !drafted.contains(&s.code))
            .map(|s| {
                let mut coding = json!({ "code": s.code, "display": s.label });
                if let Some(system) = &s.system {
                    coding["system"] = json!(system);
                }
                CardSuggestion {
                    label: s.label.clone(),
                    uuid: Uuid::new_v4().to_string(),
                    actions: vec![CardAction {
                        action_type: "create".to_string(),
                        description: format!("Order {}", s.label),
                        resource: json!({
                            "resourceType": s.resource_type,
                            "status": "draft",
                            "intent": "order",
                            "code": { "coding": [coding] },
                            "subject": { "reference": format!("Patient/{}", alert.patient_id) },
                        }),
                    }],
                }
            })
            .into_iter()
            .collect();

        CdsCard {
            uuid: Uuid::new_v4().to_string(),
            hook_instance: request.hook_instance.clone(),
            summary: truncate_summary(&alert.message),
            indicator: alert.severity.into(),
            detail: Some(format!("{} care gap identified by rule {}.", alert.category, alert.rule_id)),
            source: self.source(),
            suggestions,
        }
    }

    fn risk_card(&self, request: &HookRequest, score: &RiskScore) -> CdsCard {
        let indicator = if score.band == RiskBand::Critical {
            Indicator::Critical
        } else {
            Indicator::Warning
        };
        let mut drivers: Vec<_> = score.factors.iter().filter(|f| f.contribution > 0.0).collect();
        drivers.sort_by(|a, b| b.contribution.total_cmp(&a.contribution));
        let detail = drivers
            .iter()
            .take(3)
            .map(|f| format!("{}: {}", f.name, f.detail))
            .collect::<Vec<_>>()
            .join("; ");

        CdsCard {
            uuid: Uuid::new_v4().to_string(),
            hook_instance: request.hook_instance.clone(),
            summary: truncate_summary(&format!(
                "{} risk patient (score {:.1}, model {})",
                score.band.as_str(),
                score.value,
                score.model_version
            )),
            indicator,
            detail: (!detail.is_empty()).then_some(detail),
            source: self.source(),
            suggestions: Vec::new(),
        }
    }
}

fn truncate_summary(text: &str) -> String {
    if text.chars().count() <= SUMMARY_LIMIT {
        return text.to_string();
    }
    let mut out: String = text.chars().take(SUMMARY_LIMIT - 3).collect();
    out.push_str("...");
    out
}
