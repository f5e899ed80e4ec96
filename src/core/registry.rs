//! Loaded measure and rule definitions.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::core::measure::MeasureDefinition;
use crate::core::rules::RuleSet;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Default, Clone)]
pub struct DefinitionRegistry {
    measures: BTreeMap<String, Arc<MeasureDefinition>>,
    rule_sets: BTreeMap<String, Arc<RuleSet>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_measure(&mut self, definition: MeasureDefinition) -> EngineResult<()> {
        let id = definition.id().to_string();
        if self.measures.contains_key(&id) {
            return Err(EngineError::invalid(id, "measure defined twice"));
        }
        self.measures.insert(id, Arc::new(definition));
        Ok(())
    }

    pub fn add_rule_set(&mut self, rule_set: RuleSet) -> EngineResult<()> {
        let id = rule_set.id().to_string();
        if self.rule_sets.contains_key(&id) {
            return Err(EngineError::invalid(id, "rule set defined twice"));
        }
        self.rule_sets.insert(id, Arc::new(rule_set));
        Ok(())
    }

    /// Loads `measures/*.json` and `rules/*.json` under `root`. Any bad file,
    /// or a missing `root`, fails the whole load.
    pub fn load_dir(root: impl AsRef<Path>) -> EngineResult<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(EngineError::invalid(
                root.display().to_string(),
                "definitions directory does not exist",
            ));
        }
        let mut registry = Self::new();

        for raw in read_json_files(&root.join("measures"))? {
            registry.add_measure(MeasureDefinition::from_json(&raw)?)?;
        }
        for raw in read_json_files(&root.join("rules"))? {
            registry.add_rule_set(RuleSet::from_json(&raw)?)?;
        }

        info!(
            measures = registry.measures.len(),
            rule_sets = registry.rule_sets.len(),
            root = %root.display(),
            "definitions loaded"
        );
        if registry.measures.is_empty() && registry.rule_sets.is_empty() {
            warn!(root = %root.display(), "no definitions found; nightly runs will enqueue nothing");
        }
        Ok(registry)
    }

    pub fn measure(&self, id: &str) -> EngineResult<Arc<MeasureDefinition>> {
        self.measures
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownDefinition(id.to_string()))
    }

    pub fn rule_set(&self, id: &str) -> EngineResult<Arc<RuleSet>> {
        self.rule_sets
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownDefinition(id.to_string()))
    }

    pub fn measures(&self) -> impl Iterator<Item = &Arc<MeasureDefinition>> {
        self.measures.values()
    }

    pub fn rule_sets(&self) -> impl Iterator<Item = &Arc<RuleSet>> {
        self.rule_sets.values()
    }
}

pub(crate) fn read_json_files(dir: &Path) -> EngineResult<Vec<String>> {
    if !dir.exists() {
        warn!(dir = %dir.display(), "directory not found, nothing loaded");
        return Ok(Vec::new());
    }
    let unreadable = |e: std::io::Error| EngineError::invalid(dir.display().to_string(), e.to_string());

    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(unreadable)? {
        let path = entry.map_err(unreadable)?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            paths.push(path);
        }
    }
    paths.sort();

    paths
        .iter()
        .map(|p| fs::read_to_string(p).map_err(|e| EngineError::invalid(p.display().to_string(), e.to_string())))
        .collect()
}
