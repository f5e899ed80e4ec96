//! HTTP surface: decision-support discovery and hooks, job status and
//! operator endpoints, liveness.

use std::sync::Arc;

use crate::cds::DecisionSupportAdapter;
use crate::scheduler::Scheduler;

pub mod handlers;
pub mod routes;

pub use routes::configure;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub adapter: Arc<DecisionSupportAdapter>,
    /// Absent when the process only serves decision support.
    pub scheduler: Option<Arc<Scheduler>>,
}
