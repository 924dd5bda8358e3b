//! Canonical incident schema shared by the ingest pipeline, the store and the
//! HTTP surface.
//!
//! Every provider payload is normalised into an [`Incident`]. Status changes
//! are tracked through [`IncidentStatus`] and each one is mirrored by an
//! [`IncidentEvent`] in the audit trail.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Service name used when a payload carries no usable service identifier.
pub const UNKNOWN_SERVICE: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("invalid severity '{0}'")]
    InvalidSeverity(String),
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
    #[error("unknown event type '{0}'")]
    UnknownEventType(String),
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("incident id '{id}' is not prefixed with provider '{provider}'")]
    UnprefixedId { id: String, provider: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            _ => Err(ModelError::InvalidSeverity(value.to_string())),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Datadog,
    PagerDuty,
    Grafana,
    Sentry,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::Datadog,
        Provider::PagerDuty,
        Provider::Grafana,
        Provider::Sentry,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Datadog => "datadog",
            Provider::PagerDuty => "pagerduty",
            Provider::Grafana => "grafana",
            Provider::Sentry => "sentry",
        }
    }
}

impl FromStr for Provider {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str() == value.trim().to_lowercase())
            .ok_or_else(|| ModelError::UnknownProvider(value.to_string()))
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of an incident.
///
/// ```text
/// pending -> workflow_triggered -> in_progress -> pr_created -> resolved
///    |              |                  |
///    |              +------------------+--> failed | no_fix_needed
///    +--> requires_manual_setup (no repository mapping)
/// ```
///
/// Statuses outside this vocabulary are kept verbatim in `Other`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IncidentStatus {
    Pending,
    WorkflowTriggered,
    InProgress,
    PrCreated,
    Resolved,
    Failed,
    NoFixNeeded,
    RequiresManualSetup,
    Other(String),
}

impl IncidentStatus {
    pub fn as_str(&self) -> &str {
        match self {
            IncidentStatus::Pending => "pending",
            IncidentStatus::WorkflowTriggered => "workflow_triggered",
            IncidentStatus::InProgress => "in_progress",
            IncidentStatus::PrCreated => "pr_created",
            IncidentStatus::Resolved => "resolved",
            IncidentStatus::Failed => "failed",
            IncidentStatus::NoFixNeeded => "no_fix_needed",
            IncidentStatus::RequiresManualSetup => "requires_manual_setup",
            IncidentStatus::Other(s) => s,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IncidentStatus::Resolved | IncidentStatus::Failed | IncidentStatus::NoFixNeeded
        )
    }

    /// True while a remediation job holds a dispatch slot for the incident.
    pub fn holds_dispatch_slot(&self) -> bool {
        matches!(
            self,
            IncidentStatus::WorkflowTriggered | IncidentStatus::InProgress
        )
    }

    /// Counted as a success for statistics. A created pull request counts
    /// even before it is merged.
    pub fn counts_as_resolved(&self) -> bool {
        matches!(self, IncidentStatus::Resolved | IncidentStatus::PrCreated)
    }

    pub fn can_transition_to(&self, next: &IncidentStatus) -> bool {
        use IncidentStatus::*;

        if self == next || self.is_terminal() {
            return false;
        }
        if matches!(next, Other(_)) {
            return true;
        }
        match self {
            Pending => matches!(next, WorkflowTriggered | Failed | RequiresManualSetup),
            WorkflowTriggered => matches!(next, InProgress | PrCreated | Resolved | Failed | NoFixNeeded),
            InProgress => matches!(next, PrCreated | Resolved | Failed | NoFixNeeded),
            PrCreated => matches!(next, Resolved | Failed),
            RequiresManualSetup => matches!(next, Pending),
            Other(_) => true,
            Resolved | Failed | NoFixNeeded => false,
        }
    }
}

impl From<String> for IncidentStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "pending" => IncidentStatus::Pending,
            "workflow_triggered" => IncidentStatus::WorkflowTriggered,
            "in_progress" => IncidentStatus::InProgress,
            "pr_created" => IncidentStatus::PrCreated,
            "resolved" => IncidentStatus::Resolved,
            "failed" => IncidentStatus::Failed,
            "no_fix_needed" => IncidentStatus::NoFixNeeded,
            "requires_manual_setup" => IncidentStatus::RequiresManualSetup,
            _ => IncidentStatus::Other(value),
        }
    }
}

impl From<IncidentStatus> for String {
    fn from(value: IncidentStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub service_name: String,
    /// Target repository (`owner/name`); empty until a mapping resolves it.
    pub repository: String,
    pub error_message: String,
    pub stack_trace: Option<String>,
    pub severity: Severity,
    pub status: IncidentStatus,
    pub source: Provider,
    /// Provider payload kept verbatim, plus rule-engine metadata.
    pub metadata: Map<String, Value>,
    pub workflow_run_id: Option<String>,
    pub pr_url: Option<String>,
    pub diagnosis: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Incident {
    pub fn new(source: Provider, service_name: &str, error_message: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("{}-{}", source.as_str(), uuid::Uuid::new_v4().simple()),
            service_name: normalize_service_name(service_name),
            repository: String::new(),
            error_message: error_message.into(),
            stack_trace: None,
            severity: Severity::Medium,
            status: IncidentStatus::Pending,
            source,
            metadata: Map::new(),
            workflow_run_id: None,
            pr_url: None,
            diagnosis: None,
            created_at: now,
            updated_at: now,
            triggered_at: None,
            completed_at: None,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_stack_trace(mut self, stack_trace: Option<String>) -> Self {
        self.stack_trace = stack_trace.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Branch recorded by the service mapping, if any.
    pub fn branch(&self) -> Option<&str> {
        self.metadata.get("branch").and_then(Value::as_str)
    }
}

/// Trims the name and falls back to [`UNKNOWN_SERVICE`] when nothing is left.
pub fn normalize_service_name(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        UNKNOWN_SERVICE.to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn validate_incident(incident: &Incident) -> Result<(), ModelError> {
    if incident.id.trim().is_empty() {
        return Err(ModelError::MissingField("id"));
    }
    let prefix = format!("{}-", incident.source.as_str());
    if !incident.id.starts_with(&prefix) {
        return Err(ModelError::UnprefixedId {
            id: incident.id.clone(),
            provider: incident.source.as_str().to_string(),
        });
    }
    if incident.service_name.trim().is_empty() {
        return Err(ModelError::MissingField("service_name"));
    }
    if incident.error_message.trim().is_empty() {
        return Err(ModelError::MissingField("error_message"));
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Received,
    WorkflowTriggered,
    InProgress,
    PrCreated,
    Resolved,
    Failed,
    DequeuedForRemediation,
    DuplicateSuppressed,
    StatusChanged,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Received => "received",
            EventType::WorkflowTriggered => "workflow_triggered",
            EventType::InProgress => "in_progress",
            EventType::PrCreated => "pr_created",
            EventType::Resolved => "resolved",
            EventType::Failed => "failed",
            EventType::DequeuedForRemediation => "dequeued_for_remediation",
            EventType::DuplicateSuppressed => "duplicate_suppressed",
            EventType::StatusChanged => "status_changed",
        }
    }

    /// Audit event recorded when an incident moves into `status`.
    pub fn for_status(status: &IncidentStatus) -> EventType {
        match status {
            IncidentStatus::WorkflowTriggered => EventType::WorkflowTriggered,
            IncidentStatus::InProgress => EventType::InProgress,
            IncidentStatus::PrCreated => EventType::PrCreated,
            IncidentStatus::Resolved => EventType::Resolved,
            IncidentStatus::Failed => EventType::Failed,
            _ => EventType::StatusChanged,
        }
    }
}

impl FromStr for EventType {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        [
            EventType::Received,
            EventType::WorkflowTriggered,
            EventType::InProgress,
            EventType::PrCreated,
            EventType::Resolved,
            EventType::Failed,
            EventType::DequeuedForRemediation,
            EventType::DuplicateSuppressed,
            EventType::StatusChanged,
        ]
        .into_iter()
        .find(|t| t.as_str() == value)
        .ok_or_else(|| ModelError::UnknownEventType(value.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IncidentEvent {
    pub id: Option<i64>,
    pub incident_id: String,
    pub event_type: EventType,
    pub data: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Document handed to the remediation job with every trigger attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IncidentContext {
    pub incident_id: String,
    pub service_name: String,
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    pub severity: Severity,
    pub source: Provider,
    /// RFC-3339 creation time of the incident.
    pub timestamp: String,
}

impl From<&Incident> for IncidentContext {
    fn from(incident: &Incident) -> Self {
        Self {
            incident_id: incident.id.clone(),
            service_name: incident.service_name.clone(),
            repository: incident.repository.clone(),
            branch: incident.branch().map(ToString::to_string),
            error_message: incident.error_message.clone(),
            stack_trace: incident.stack_trace.clone(),
            severity: incident.severity,
            source: incident.source,
            timestamp: incident.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Fixed-width RFC-3339 form used for persisted timestamps, so that text
/// ordering matches chronological ordering.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}
