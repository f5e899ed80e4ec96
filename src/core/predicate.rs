//! Typed predicate language used by measure populations and rule conditions.
//!
//! A predicate is a closed expression tree: fact existence, fact value
//! comparison, fact counts, temporal windows and boolean combinators.
//! Evaluation is total and pure; structural problems are caught by
//! [`Predicate::validate`] when a definition is loaded.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::models::{Fact, FactType, PatientContext, Period};

const MAX_DEPTH: usize = 32;
/// Roughly a century either way.
const MAX_LOOKBACK_DAYS: u32 = 36_600;
const MAX_LOOKBACK_MONTHS: u32 = 1_200;

/// Which facts a leaf predicate looks at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactQuery {
    pub fact: FactType,
    /// Accepted codes; empty accepts any code.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub codes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl FactQuery {
    pub fn new(fact: FactType, codes: &[&str]) -> Self {
        Self {
            fact,
            codes: codes.iter().map(|c| c.to_string()).collect(),
            status: None,
        }
    }

    fn matches(&self, fact: &Fact) -> bool {
        let code_ok = self.codes.is_empty() || self.codes.iter().any(|c| c == &fact.code);
        let status_ok = match &self.status {
            Some(wanted) => fact.status.as_deref() == Some(wanted.as_str()),
            None => true,
        };
        code_ok && status_ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparator {
    fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparator::Lt => lhs < rhs,
            Comparator::Le => lhs <= rhs,
            Comparator::Gt => lhs > rhs,
            Comparator::Ge => lhs >= rhs,
            Comparator::Eq => lhs == rhs,
            Comparator::Ne => lhs != rhs,
        }
    }
}

/// Which matching fact a comparison inspects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pick {
    /// The most recent matching fact carrying a value.
    #[default]
    Latest,
    /// Any matching fact.
    Any,
}

/// Temporal window, always closed-open and anchored on the evaluation period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Window {
    /// `[period.start, period.end)`
    Period,
    /// `[period.end - days, period.end)`
    LookbackDays { days: u32 },
    /// `[period.end - months, period.end)`
    LookbackMonths { months: u32 },
}

impl Window {
    fn resolve(&self, period: &Period) -> Bounds {
        let start = match *self {
            Window::Period => Some(period.start),
            Window::LookbackDays { days } => period.end.checked_sub_signed(Duration::days(i64::from(days))),
            Window::LookbackMonths { months } => period.end.checked_sub_months(Months::new(months)),
        };
        Bounds {
            start,
            end: Some(period.end),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    Exists {
        #[serde(flatten)]
        query: FactQuery,
    },
    Compare {
        #[serde(flatten)]
        query: FactQuery,
        comparator: Comparator,
        threshold: f64,
        #[serde(default)]
        pick: Pick,
    },
    Count {
        #[serde(flatten)]
        query: FactQuery,
        at_least: usize,
    },
    Within {
        window: Window,
        predicate: Box<Predicate>,
    },
    All {
        of: Vec<Predicate>,
    },
    Any {
        of: Vec<Predicate>,
    },
    Not {
        predicate: Box<Predicate>,
    },
}

#[derive(Debug, Clone, Copy)]
struct Bounds {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

/// What a predicate is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    context: &'a PatientContext,
    period: Period,
    bounds: Bounds,
}

impl<'a> Scope<'a> {
    /// Outside any explicit window, facts dated at or after the period end
    /// are invisible.
    pub fn new(context: &'a PatientContext, period: Period) -> Self {
        Self {
            context,
            period,
            bounds: Bounds {
                start: None,
                end: Some(period.end),
            },
        }
    }

    fn narrowed(&self, window: &Window) -> Self {
        Self {
            bounds: window.resolve(&self.period),
            ..*self
        }
    }

    fn facts(&self, kind: &FactType) -> &'a [Fact] {
        self.context.facts_between(kind, self.bounds.start, self.bounds.end)
    }
}

/// Facts that made a predicate true.
#[derive(Debug, Default, Clone)]
pub struct Evidence {
    collecting: bool,
    pub fact_ids: BTreeSet<String>,
    pub latest_value: Option<f64>,
}

impl Evidence {
    pub fn collecting() -> Self {
        Self {
            collecting: true,
            ..Default::default()
        }
    }

    fn discard() -> Self {
        Self::default()
    }

    fn child(&self) -> Self {
        Self {
            collecting: self.collecting,
            ..Default::default()
        }
    }

    fn record(&mut self, fact: &Fact) {
        if self.collecting {
            self.fact_ids.insert(fact.id.clone());
            if fact.value.is_some() {
                self.latest_value = fact.value;
            }
        }
    }

    fn merge(&mut self, other: Evidence) {
        self.fact_ids.extend(other.fact_ids);
        if other.latest_value.is_some() {
            self.latest_value = other.latest_value;
        }
    }
}

impl Predicate {
    pub fn exists(fact: FactType, codes: &[&str]) -> Self {
        Predicate::Exists {
            query: FactQuery::new(fact, codes),
        }
    }

    pub fn compare(fact: FactType, codes: &[&str], comparator: Comparator, threshold: f64) -> Self {
        Predicate::Compare {
            query: FactQuery::new(fact, codes),
            comparator,
            threshold,
            pick: Pick::Latest,
        }
    }

    pub fn within(window: Window, predicate: Predicate) -> Self {
        Predicate::Within {
            window,
            predicate: Box::new(predicate),
        }
    }

    pub fn all(of: Vec<Predicate>) -> Self {
        Predicate::All { of }
    }

    pub fn any(of: Vec<Predicate>) -> Self {
        Predicate::Any { of }
    }

    pub fn negate(predicate: Predicate) -> Self {
        Predicate::Not {
            predicate: Box::new(predicate),
        }
    }

    /// Plain truth value, stopping at the first fact that decides it.
    pub fn is_satisfied(&self, scope: &Scope<'_>) -> bool {
        self.eval(scope, &mut Evidence::discard())
    }

    /// Truth value plus the ids of the facts that made it true.
    pub fn evaluate(&self, scope: &Scope<'_>) -> (bool, Evidence) {
        let mut evidence = Evidence::collecting();
        let matched = self.eval(scope, &mut evidence);
        if !matched {
            evidence = Evidence::collecting();
        }
        (matched, evidence)
    }

    fn eval(&self, scope: &Scope<'_>, evidence: &mut Evidence) -> bool {
        match self {
            Predicate::Exists { query } => {
                let mut hits = scope.facts(&query.fact).iter().filter(|f| query.matches(f));
                if !evidence.collecting {
                    return hits.next().is_some();
                }
                let mut found = false;
                for fact in hits {
                    evidence.record(fact);
                    found = true;
                }
                found
            }
            Predicate::Compare {
                query,
                comparator,
                threshold,
                pick,
            } => {
                let facts = scope.facts(&query.fact);
                match pick {
                    Pick::Latest => {
                        let latest = facts
                            .iter()
                            .rev()
                            .find(|f| query.matches(f) && f.value.is_some());
                        match latest {
                            Some(fact) if fact.value.is_some_and(|v| comparator.apply(v, *threshold)) => {
                                evidence.record(fact);
                                true
                            }
                            _ => false,
                        }
                    }
                    Pick::Any => {
                        let mut found = false;
                        for fact in facts.iter().filter(|f| query.matches(f)) {
                            if fact.value.is_some_and(|v| comparator.apply(v, *threshold)) {
                                evidence.record(fact);
                                found = true;
                                if !evidence.collecting {
                                    break;
                                }
                            }
                        }
                        found
                    }
                }
            }
            Predicate::Count { query, at_least } => {
                let matching: Vec<&Fact> = scope
                    .facts(&query.fact)
                    .iter()
                    .filter(|f| query.matches(f))
                    .collect();
                if matching.len() >= *at_least {
                    for fact in matching {
                        evidence.record(fact);
                    }
                    true
                } else {
                    false
                }
            }
            Predicate::Within { window, predicate } => predicate.eval(&scope.narrowed(window), evidence),
            Predicate::All { of } => {
                let mut gathered = evidence.child();
                for child in of {
                    if !child.eval(scope, &mut gathered) {
                        return false;
                    }
                }
                evidence.merge(gathered);
                true
            }
            Predicate::Any { of } => {
                for child in of {
                    let mut branch = evidence.child();
                    if child.eval(scope, &mut branch) {
                        evidence.merge(branch);
                        return true;
                    }
                }
                false
            }
            Predicate::Not { predicate } => !predicate.eval(scope, &mut Evidence::discard()),
        }
    }

    /// Structural checks run once at load time; `owner` names the definition
    /// in the resulting error.
    pub fn validate(&self, owner: &str) -> EngineResult<()> {
        self.validate_at(owner, 1)
    }

    fn validate_at(&self, owner: &str, depth: usize) -> EngineResult<()> {
        if depth > MAX_DEPTH {
            return Err(EngineError::invalid(
                owner,
                format!("predicate nesting exceeds {} levels", MAX_DEPTH),
            ));
        }
        match self {
            Predicate::Exists { query } => validate_query(owner, query),
            Predicate::Compare { query, threshold, .. } => {
                validate_query(owner, query)?;
                if !threshold.is_finite() {
                    return Err(EngineError::invalid(owner, "comparison threshold must be finite"));
                }
                Ok(())
            }
            Predicate::Count { query, at_least } => {
                validate_query(owner, query)?;
                if *at_least == 0 {
                    return Err(EngineError::invalid(owner, "count predicate needs at_least >= 1"));
                }
                Ok(())
            }
            Predicate::Within { window, predicate } => {
                match *window {
                    Window::LookbackDays { days: 0 } | Window::LookbackMonths { months: 0 } => {
                        return Err(EngineError::invalid(owner, "look-back window must be positive"));
                    }
                    Window::LookbackDays { days } if days > MAX_LOOKBACK_DAYS => {
                        return Err(EngineError::invalid(
                            owner,
                            format!("look-back of {} days exceeds {}", days, MAX_LOOKBACK_DAYS),
                        ));
                    }
                    Window::LookbackMonths { months } if months > MAX_LOOKBACK_MONTHS => {
                        return Err(EngineError::invalid(
                            owner,
                            format!("look-back of {} months exceeds {}", months, MAX_LOOKBACK_MONTHS),
                        ));
                    }
                    _ => {}
                }
                predicate.validate_at(owner, depth + 1)
            }
            Predicate::All { of } | Predicate::Any { of } => {
                if of.is_empty() {
                    return Err(EngineError::invalid(owner, "boolean combinator has no operands"));
                }
                for child in of {
                    child.validate_at(owner, depth + 1)?;
                }
                Ok(())
            }
            Predicate::Not { predicate } => predicate.validate_at(owner, depth + 1),
        }
    }
}

fn validate_query(owner: &str, query: &FactQuery) -> EngineResult<()> {
    if query.fact.as_str().trim().is_empty() {
        return Err(EngineError::invalid(owner, "fact type must not be empty"));
    }
    if query.codes.iter().any(|c| c.trim().is_empty()) {
        return Err(EngineError::invalid(owner, "fact codes must not be empty"));
    }
    Ok(())
}
