//! Condition/action rules producing care-gap alerts.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::clock::Clock;
use crate::core::predicate::{Evidence, Predicate, Scope};
use crate::error::{EngineError, EngineResult};
use crate::models::{CareGapAlert, DedupKey, PatientContext, Period, Severity, Suggestion};

/// Rules look at the twelve months leading up to the evaluation instant.
const RULE_LOOKBACK_MONTHS: u32 = 12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleAction {
    pub category: String,
    pub severity: Severity,
    /// Message template; see [`render_message`] for the placeholders.
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<Suggestion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    /// Higher wins.
    #[serde(default)]
    pub priority: i32,
    pub condition: Predicate,
    pub action: RuleAction,
    /// Lower-priority rules whose alerts this rule silences when both fire.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub suppresses: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSetDocument {
    pub id: String,
    pub version: String,
    pub rules: Vec<Rule>,
}

/// A validated rule set, kept in output order (priority descending, then id).
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSet {
    id: String,
    version: String,
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn load(doc: RuleSetDocument) -> EngineResult<Self> {
        if doc.id.trim().is_empty() {
            return Err(EngineError::invalid("<unnamed rule set>", "rule set id is empty"));
        }

        let mut priorities: HashMap<&str, i32> = HashMap::new();
        for rule in &doc.rules {
            if rule.id.trim().is_empty() {
                return Err(EngineError::invalid(&doc.id, "rule id is empty"));
            }
            if priorities.insert(rule.id.as_str(), rule.priority).is_some() {
                return Err(EngineError::invalid(&rule.id, "duplicate rule id"));
            }
        }

        for rule in &doc.rules {
            rule.condition.validate(&rule.id)?;
            if rule.action.message.trim().is_empty() {
                return Err(EngineError::invalid(&rule.id, "alert message is empty"));
            }
            if rule.action.category.trim().is_empty() {
                return Err(EngineError::invalid(&rule.id, "alert category is empty"));
            }
            for target in &rule.suppresses {
                match priorities.get(target.as_str()) {
                    None => {
                        return Err(EngineError::invalid(
                            &rule.id,
                            format!("suppresses unknown rule `{}`", target),
                        ))
                    }
                    Some(&p) if p >= rule.priority => {
                        return Err(EngineError::invalid(
                            &rule.id,
                            format!("suppresses `{}` which does not have lower priority", target),
                        ))
                    }
                    Some(_) => {}
                }
            }
        }

        let mut rules = doc.rules;
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        Ok(Self {
            id: doc.id,
            version: doc.version,
            rules,
        })
    }

    pub fn from_json(raw: &str) -> EngineResult<Self> {
        let doc: RuleSetDocument = serde_json::from_str(raw)
            .map_err(|e| EngineError::invalid("<rule set document>", e.to_string()))?;
        Self::load(doc)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }
}

/// Expands `{patient_id}`, `{rule_id}`, `{evidence_count}` and `{latest_value}`.
pub fn render_message(template: &str, rule_id: &str, patient_id: &str, evidence: &Evidence) -> String {
    let latest = evidence
        .latest_value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "n/a".to_string());
    template
        .replace("{patient_id}", patient_id)
        .replace("{rule_id}", rule_id)
        .replace("{evidence_count}", &evidence.fact_ids.len().to_string())
        .replace("{latest_value}", &latest)
}

#[derive(Debug, Clone)]
struct OpenEntry {
    rule_id: String,
    patient_id: String,
    context_version: u64,
}

/// Keys of alerts that have been emitted and not yet resolved.
#[derive(Debug, Default)]
pub struct AlertLedger {
    open: DashMap<DedupKey, OpenEntry>,
}

impl AlertLedger {
    /// Records the alert's key; false when it was already open.
    pub fn try_open(&self, alert: &CareGapAlert) -> bool {
        match self.open.entry(alert.dedup_key.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(OpenEntry {
                    rule_id: alert.rule_id.clone(),
                    patient_id: alert.patient_id.clone(),
                    context_version: alert.context_version,
                });
                true
            }
        }
    }

    pub fn resolve(&self, key: &DedupKey) -> bool {
        self.open.remove(key).is_some()
    }

    pub fn is_open(&self, key: &DedupKey) -> bool {
        self.open.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// Open keys of the given rules for the patient that were opened on an
    /// older context and are not among `current`.
    fn closed_by(
        &self,
        rule_ids: &BTreeSet<&str>,
        patient_id: &str,
        version: u64,
        current: &BTreeSet<&DedupKey>,
    ) -> Vec<DedupKey> {
        let mut closed: Vec<DedupKey> = self
            .open
            .iter()
            .filter(|e| {
                e.patient_id == patient_id
                    && e.context_version < version
                    && rule_ids.contains(e.rule_id.as_str())
                    && !current.contains(e.key())
            })
            .map(|e| e.key().clone())
            .collect();
        closed.sort();
        closed
    }
}

/// Alerts opened by one evaluation that still have to be persisted.
///
/// Keys stay open only once committed. Dropping the batch releases every
/// uncommitted key, so a persist that fails or is cancelled part-way can be
/// retried and still emit the alert.
#[must_use]
pub struct OpenedAlerts<'a> {
    ledger: &'a AlertLedger,
    alerts: Vec<CareGapAlert>,
    committed: usize,
    closed: Vec<DedupKey>,
}

impl<'a> OpenedAlerts<'a> {
    pub fn alerts(&self) -> &[CareGapAlert] {
        &self.alerts
    }

    /// Open keys of this rule set whose gap no longer holds on the evaluated
    /// context. They stay open in the ledger until resolved.
    pub fn closed(&self) -> &[DedupKey] {
        &self.closed
    }

    pub fn next_uncommitted(&self) -> Option<&CareGapAlert> {
        self.alerts.get(self.committed)
    }

    /// Marks the alert returned by [`next_uncommitted`](Self::next_uncommitted) as persisted.
    pub fn commit_next(&mut self) {
        self.committed = (self.committed + 1).min(self.alerts.len());
    }

    /// Keeps every key open and hands back the alerts.
    pub fn commit(mut self) -> Vec<CareGapAlert> {
        self.committed = self.alerts.len();
        std::mem::take(&mut self.alerts)
    }
}

impl Drop for OpenedAlerts<'_> {
    fn drop(&mut self) {
        let released = &self.alerts[self.committed.min(self.alerts.len())..];
        for alert in released {
            self.ledger.resolve(&alert.dedup_key);
        }
        if !released.is_empty() {
            debug!(count = released.len(), "released unpersisted alert keys");
        }
    }
}

pub struct RulesEngine {
    clock: Arc<dyn Clock>,
    ledger: AlertLedger,
}

impl RulesEngine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            ledger: AlertLedger::default(),
        }
    }

    pub fn ledger(&self) -> &AlertLedger {
        &self.ledger
    }

    /// Every alert whose condition currently holds, after suppression.
    /// Does not consult or touch the open-alert ledger.
    #[instrument(skip_all, fields(rule_set = %rules.id(), patient_id = %context.patient_id()))]
    pub fn fire(&self, rules: &RuleSet, context: &PatientContext) -> EngineResult<Vec<CareGapAlert>> {
        let now = self.clock.now();
        let period = Period::trailing_months(now, RULE_LOOKBACK_MONTHS)?;
        let scope = Scope::new(context, period);

        let mut fired = Vec::new();
        for rule in &rules.rules {
            let (matched, evidence) = rule.condition.evaluate(&scope);
            if !matched {
                continue;
            }
            let dedup_key = DedupKey::new(&rule.id, context.patient_id(), &evidence.fact_ids);
            fired.push(CareGapAlert {
                rule_id: rule.id.clone(),
                patient_id: context.patient_id().to_string(),
                priority: rule.priority,
                category: rule.action.category.clone(),
                severity: rule.action.severity,
                message: render_message(&rule.action.message, &rule.id, context.patient_id(), &evidence),
                generated_at: now,
                context_version: context.version(),
                dedup_key,
                evidence: evidence.fact_ids.into_iter().collect(),
                suggestion: rule.action.suggestion.clone(),
                resolved_at: None,
            });
        }

        // Suppressors are taken from everything that fired, so a suppressed
        // rule still silences its own targets.
        let suppressed: BTreeSet<&str> = rules
            .rules
            .iter()
            .filter(|r| fired.iter().any(|a| a.rule_id == r.id))
            .flat_map(|r| r.suppresses.iter().map(String::as_str))
            .collect();
        let before = fired.len();
        fired.retain(|a| !suppressed.contains(a.rule_id.as_str()));

        debug!(fired = before, suppressed = before - fired.len(), "rules fired");
        Ok(fired)
    }

    /// Opens the ledger key of every fired alert that has no open alert yet,
    /// and reports open keys whose gap has closed since an older context.
    #[instrument(skip_all, fields(rule_set = %rules.id(), patient_id = %context.patient_id()))]
    pub fn open(&self, rules: &RuleSet, context: &PatientContext) -> EngineResult<OpenedAlerts<'_>> {
        let fired = self.fire(rules, context)?;

        let rule_ids: BTreeSet<&str> = rules.rules.iter().map(|r| r.id.as_str()).collect();
        let current: BTreeSet<&DedupKey> = fired.iter().map(|a| &a.dedup_key).collect();
        let closed = self
            .ledger
            .closed_by(&rule_ids, context.patient_id(), context.version(), &current);

        let alerts: Vec<CareGapAlert> = fired.into_iter().filter(|a| self.ledger.try_open(a)).collect();
        if !alerts.is_empty() || !closed.is_empty() {
            info!(opened = alerts.len(), closed = closed.len(), "care-gap alerts changed");
        }
        Ok(OpenedAlerts {
            ledger: &self.ledger,
            alerts,
            committed: 0,
            closed,
        })
    }

    /// Like [`fire`](Self::fire), but only returns alerts whose dedup key has
    /// no open alert yet, and opens them.
    pub fn evaluate(&self, rules: &RuleSet, context: &PatientContext) -> EngineResult<Vec<CareGapAlert>> {
        Ok(self.open(rules, context)?.commit())
    }

    pub fn resolve(&self, key: &DedupKey) -> bool {
        self.ledger.resolve(key)
    }
}
