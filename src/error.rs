//! Error taxonomy shared by the engines, the context builder and the scheduler.

use std::time::Duration;

use thiserror::Error;

/// Every failure the evaluation core can report.
///
/// Cloneable so that a single in-flight context build can hand the same
/// outcome to every waiter.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Bad configuration or definition content. Only ever raised at load time.
    #[error("invalid definition `{id}`: {reason}")]
    InvalidDefinition { id: String, reason: String },

    #[error("context for patient {patient_id} (version {version}) is {age_secs}s old")]
    StaleContext {
        patient_id: String,
        version: u64,
        age_secs: i64,
    },

    #[error("clinical data source unavailable: {0}")]
    DataSourceUnavailable(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Recorded on the job that tipped its stream over the failure ceiling.
    #[error("{stream} abandoned after {failures} consecutive failures ({cause}); requires operator reset")]
    Abandoned {
        stream: String,
        failures: u32,
        cause: String,
    },

    #[error("unknown definition `{0}`")]
    UnknownDefinition(String),

    #[error("unknown patient `{0}`")]
    UnknownPatient(String),

    #[error("result store error: {0}")]
    Storage(String),

    #[error("narrative service error: {reason}")]
    Narrative { reason: String, retryable: bool },
}

impl EngineError {
    pub fn invalid(id: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::InvalidDefinition {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn narrative(reason: impl Into<String>, retryable: bool) -> Self {
        EngineError::Narrative {
            reason: reason.into(),
            retryable,
        }
    }

    /// Failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::DataSourceUnavailable(_) | EngineError::Timeout(_) => true,
            EngineError::Narrative { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Failures that are resolved by rebuilding the patient context.
    pub fn is_stale(&self) -> bool {
        matches!(self, EngineError::StaleContext { .. })
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Storage(format!("serialization: {}", err))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return EngineError::narrative(format!("request timed out: {}", err), true);
        }
        // 5xx and 429 may succeed later; other statuses, bad requests and
        // undecodable bodies will not
        let retryable = match err.status() {
            Some(status) => status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS,
            None => err.is_connect() || err.is_request(),
        };
        EngineError::narrative(err.to_string(), retryable)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
