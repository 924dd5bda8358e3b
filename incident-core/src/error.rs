use incident_model::{IncidentStatus, ModelError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("incident store unavailable: {0}")]
    Unavailable(String),
    #[error("incident '{0}' not found")]
    NotFound(String),
    #[error("incident '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: IncidentStatus,
        to: IncidentStatus,
    },
}

/// Rejection of an operator-defined rule at load time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("rule #{index} has no name")]
    MissingName { index: usize },
    #[error("rule '{rule}' has an invalid error pattern: {reason}")]
    InvalidPattern { rule: String, reason: String },
    #[error("rule '{rule}' uses invalid severity '{value}' in its {place}")]
    InvalidSeverity {
        rule: String,
        value: String,
        place: &'static str,
    },
    #[error("rule '{0}' has no conditions")]
    NoConditions(String),
    #[error("rule '{0}' has no actions")]
    NoActions(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid rule: {0}")]
    Rule(#[from] RuleError),
    #[error("service mapping for '{0}' has an empty repository")]
    EmptyRepository(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("workflow trigger request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("workflow trigger returned HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("workflow trigger attempt timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

/// Pipeline-level outcome taxonomy; the HTTP layer maps each variant to a
/// status code.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid incident: {0}")]
    Validation(#[from] ModelError),
    #[error("{0}")]
    BadRequest(String),
    #[error("incident '{0}' not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ServiceError::NotFound(id),
            StoreError::InvalidTransition { .. } => ServiceError::Conflict(err.to_string()),
            other => ServiceError::Storage(other),
        }
    }
}
