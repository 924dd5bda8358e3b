//! Starting the remediation job in the external execution environment.

use crate::error::DispatchError;
use async_trait::async_trait;
use incident_model::IncidentContext;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Starts one remediation run. A returned `Some` is the external run
/// reference, when the environment hands one back.
#[async_trait]
pub trait WorkflowTrigger: Send + Sync + 'static {
    async fn trigger(&self, context: &IncidentContext) -> Result<Option<String>, DispatchError>;
}

#[derive(Clone, Debug)]
pub struct HttpTriggerConfig {
    pub api_url: String,
    pub token: Option<String>,
    pub event_type: String,
    pub attempt_timeout: Duration,
}

impl Default for HttpTriggerConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".into(),
            token: None,
            event_type: "incident-remediation".into(),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Serialize)]
struct DispatchBody<'a> {
    event_type: &'a str,
    client_payload: &'a IncidentContext,
}

/// Fires a repository dispatch event carrying the incident context.
pub struct HttpWorkflowTrigger {
    client: reqwest::Client,
    config: HttpTriggerConfig,
}

impl HttpWorkflowTrigger {
    pub fn new(config: HttpTriggerConfig) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(config.attempt_timeout)
            .user_agent(concat!("incident-remediator/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, config })
    }

    pub fn dispatch_url(&self, repository: &str) -> String {
        format!(
            "{}/repos/{}/dispatches",
            self.config.api_url.trim_end_matches('/'),
            repository
        )
    }
}

#[async_trait]
impl WorkflowTrigger for HttpWorkflowTrigger {
    async fn trigger(&self, context: &IncidentContext) -> Result<Option<String>, DispatchError> {
        let url = self.dispatch_url(&context.repository);
        let mut request = self
            .client
            .post(&url)
            .header("Accept", "application/vnd.github+json")
            .json(&DispatchBody {
                event_type: &self.config.event_type,
                client_payload: context,
            });
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                DispatchError::Timeout
            } else {
                DispatchError::Transport(err)
            }
        })?;

        let status = response.status();
        debug!(incident_id = %context.incident_id, %url, status = status.as_u16(), "workflow trigger response");
        if status.is_success() {
            return Ok(None);
        }

        let body = response.text().await.unwrap_or_default();
        Err(DispatchError::Rejected {
            status: status.as_u16(),
            body: body.chars().take(512).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_url_targets_repository() {
        let trigger = HttpWorkflowTrigger::new(HttpTriggerConfig {
            api_url: "https://git.example.test/api/".into(),
            ..HttpTriggerConfig::default()
        })
        .expect("client");
        assert_eq!(
            trigger.dispatch_url("acme/checkout"),
            "https://git.example.test/api/repos/acme/checkout/dispatches"
        );
    }
}
