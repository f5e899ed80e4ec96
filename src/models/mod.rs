//! Data model shared across the engines, the scheduler and the HTTP surface.

pub mod alert;
pub mod card;
pub mod context;
pub mod insight;
pub mod job;
pub mod measure;
pub mod risk;

pub use alert::{CareGapAlert, DedupKey, Severity};
pub use card::{CdsCard, HookResponse, Indicator, Suggestion};
pub use context::{Fact, FactType, PatientContext};
pub use insight::Narrative;
pub use job::{Job, JobId, JobKind, JobSpec, JobStatus, StreamKey};
pub use measure::{MeasureResult, MeasureResultKey, MeasureSummary, Period, PopulationFlags};
pub use risk::{FactorContribution, FactorStatus, RiskBand, RiskScore};
