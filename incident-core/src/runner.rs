//! Status callback contract between the remediation runner and the service.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Longest diagnosis the runner transmits, in characters.
pub const MAX_DIAGNOSIS_CHARS: usize = 500;

/// Body of `POST /webhooks/workflow-status`. Fields default to empty so the
/// receiving side can report exactly which required ones are missing.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatusReport {
    #[serde(default)]
    pub incident_id: String,
    /// `success`, `failed`, `no_fix_needed`, or `in_progress`.
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<String>,
    #[serde(default)]
    pub repository: String,
}

impl WorkflowStatusReport {
    /// Names of required fields that are blank.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.incident_id.trim().is_empty() {
            missing.push("incident_id");
        }
        if self.status.trim().is_empty() {
            missing.push("status");
        }
        if self.repository.trim().is_empty() {
            missing.push("repository");
        }
        missing
    }
}

pub fn truncate_diagnosis(text: &str) -> String {
    text.chars().take(MAX_DIAGNOSIS_CHARS).collect()
}

/// Client the remediation runner uses to report its result.
pub struct StatusReporter {
    client: reqwest::Client,
    endpoint: String,
}

impl StatusReporter {
    pub fn new(service_url: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/webhooks/workflow-status", service_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn report(&self, mut report: WorkflowStatusReport) -> Result<(), reqwest::Error> {
        report.diagnosis = report.diagnosis.as_deref().map(truncate_diagnosis);
        self.client
            .post(&self.endpoint)
            .json(&report)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Reports and swallows delivery failures; a lost report must not fail
    /// the remediation run.
    pub async fn report_best_effort(&self, report: WorkflowStatusReport) -> bool {
        let incident_id = report.incident_id.clone();
        match self.report(report).await {
            Ok(()) => {
                info!(incident_id = %incident_id, "workflow status reported");
                true
            }
            Err(err) => {
                warn!(incident_id = %incident_id, error = %err, "could not report workflow status, continuing");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnosis_is_truncated_on_char_boundaries() {
        let long = "é".repeat(800);
        let truncated = truncate_diagnosis(&long);
        assert_eq!(truncated.chars().count(), MAX_DIAGNOSIS_CHARS);
        assert_eq!(truncate_diagnosis("short"), "short");
    }

    #[test]
    fn missing_fields_are_reported_by_name() {
        let report = WorkflowStatusReport {
            incident_id: "sentry-1".into(),
            ..WorkflowStatusReport::default()
        };
        assert_eq!(report.missing_fields(), vec!["status", "repository"]);
    }

    #[tokio::test]
    async fn unreachable_service_does_not_fail_the_run() {
        let reporter = StatusReporter::new("http://127.0.0.1:9/").expect("client");
        assert_eq!(reporter.endpoint(), "http://127.0.0.1:9/webhooks/workflow-status");

        let delivered = reporter
            .report_best_effort(WorkflowStatusReport {
                incident_id: "sentry-1".into(),
                status: "failed".into(),
                diagnosis: Some("x".repeat(2000)),
                repository: "acme/api".into(),
                ..WorkflowStatusReport::default()
            })
            .await;
        assert!(!delivered);
    }
}
