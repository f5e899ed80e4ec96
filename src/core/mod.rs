pub mod ai;
pub mod context;
pub mod data;
pub mod measure;
pub mod predicate;
pub mod registry;
pub mod risk;
pub mod rules;

pub use ai::{HttpNarrativeService, NarrativeService};
pub use context::{ClinicalDataSource, ContextBuilder, ContextCache, InMemoryDataSource};
pub use data::RawBundle;
pub use measure::{MeasureDefinition, MeasureEngine};
pub use predicate::Predicate;
pub use registry::DefinitionRegistry;
pub use risk::{RiskModelConfig, RiskScoringModule};
pub use rules::{RuleSet, RulesEngine};
