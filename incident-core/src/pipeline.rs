//! Ingest and completion flows tying the rule engine, deduplication, the
//! store and the dispatch coordinator together.

use crate::config::ConfigHandle;
use crate::dedup::DedupFilter;
use crate::dispatch::DispatchCoordinator;
use crate::error::ServiceError;
use crate::rules::{apply_actions, should_skip_remediation};
use crate::runner::WorkflowStatusReport;
use crate::store::{CreateOutcome, IncidentStore, StatusUpdate};
use chrono::Utc;
use incident_model::{validate_incident, Incident, IncidentStatus};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Stored; dispatch proceeds in the background.
    Accepted,
    /// Collapsed into an existing incident.
    Duplicate,
    /// Stored without a repository; an operator has to map the service.
    RequiresManualSetup,
    /// Stored; a rule asked for no automated remediation.
    RemediationSkipped,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub incident_id: String,
    pub disposition: Disposition,
}

#[derive(Clone)]
pub struct IncidentService {
    store: IncidentStore,
    config: ConfigHandle,
    dedup: DedupFilter,
    coordinator: DispatchCoordinator,
}

impl IncidentService {
    pub fn new(
        store: IncidentStore,
        config: ConfigHandle,
        dedup: DedupFilter,
        coordinator: DispatchCoordinator,
    ) -> Self {
        Self {
            store,
            config,
            dedup,
            coordinator,
        }
    }

    pub fn store(&self) -> &IncidentStore {
        &self.store
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn coordinator(&self) -> &DispatchCoordinator {
        &self.coordinator
    }

    pub fn dedup_window(&self) -> Duration {
        self.dedup.window()
    }

    /// Classifies, deduplicates and stores `incident`. Returns as soon as the
    /// incident is durable; dispatch runs on a spawned task.
    pub async fn ingest(&self, mut incident: Incident) -> Result<IngestOutcome, ServiceError> {
        validate_incident(&incident)?;
        let config = self.config.current();

        let matches = config.rules.evaluate(&incident);
        if !matches.is_empty() {
            let names: Vec<&str> = matches.iter().map(|m| m.rule_name.as_str()).collect();
            info!(incident_id = %incident.id, rules = ?names, "custom rules matched");
        }
        apply_actions(&mut incident, &matches);

        if let Some(mapping) = config.mapping_for(&incident.service_name) {
            if incident.repository.is_empty() {
                incident.repository = mapping.repository.clone();
            }
            if incident.repository == mapping.repository {
                incident
                    .metadata
                    .insert("branch".into(), Value::String(mapping.branch.clone()));
            }
        }

        let skip = should_skip_remediation(&matches);
        if skip {
            incident
                .metadata
                .insert("remediation_skipped".into(), Value::Bool(true));
        }

        if let CreateOutcome::Duplicate { existing_id } = self.dedup.admit(&self.store, &incident)? {
            return Ok(IngestOutcome {
                incident_id: existing_id,
                disposition: Disposition::Duplicate,
            });
        }
        metrics::counter!("incidents_received_total", "provider" => incident.source.as_str())
            .increment(1);
        info!(
            incident_id = %incident.id,
            provider = %incident.source,
            service = %incident.service_name,
            repository = %incident.repository,
            severity = %incident.severity,
            "incident stored"
        );

        if incident.repository.is_empty() {
            self.store.transition(
                &incident.id,
                IncidentStatus::RequiresManualSetup,
                StatusUpdate {
                    data: Some(serde_json::json!({
                        "reason": format!("no repository mapping for service '{}'", incident.service_name),
                    })),
                    ..StatusUpdate::default()
                },
            )?;
            warn!(
                incident_id = %incident.id,
                service = %incident.service_name,
                "no repository mapping, remediation needs manual setup"
            );
            return Ok(IngestOutcome {
                incident_id: incident.id,
                disposition: Disposition::RequiresManualSetup,
            });
        }

        if skip {
            info!(incident_id = %incident.id, "remediation skipped by rule");
            return Ok(IngestOutcome {
                incident_id: incident.id,
                disposition: Disposition::RemediationSkipped,
            });
        }

        let incident_id = incident.id.clone();
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            coordinator.dispatch(incident).await;
        });

        Ok(IngestOutcome {
            incident_id,
            disposition: Disposition::Accepted,
        })
    }

    /// Applies a status callback from the remediation runner and frees the
    /// repository slot once the job has finished.
    pub fn complete_workflow(&self, report: WorkflowStatusReport) -> Result<Incident, ServiceError> {
        let missing = report.missing_fields();
        if !missing.is_empty() {
            return Err(ServiceError::BadRequest(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }

        let next = match report.status.as_str() {
            "success" if report.pr_url.is_some() => IncidentStatus::PrCreated,
            "success" => IncidentStatus::Resolved,
            "failed" => IncidentStatus::Failed,
            "no_fix_needed" => IncidentStatus::NoFixNeeded,
            "in_progress" => IncidentStatus::InProgress,
            other => {
                return Err(ServiceError::BadRequest(format!(
                    "unknown workflow status '{other}', expected one of success, failed, no_fix_needed, in_progress"
                )))
            }
        };

        let transition = self.store.complete(
            &report.incident_id,
            next,
            report.pr_url.clone(),
            report.diagnosis.clone(),
        )?;

        let incident = transition.incident;
        info!(
            incident_id = %incident.id,
            repository = %report.repository,
            status = %incident.status,
            "workflow status recorded"
        );

        let repository = if incident.repository.is_empty() {
            report.repository.as_str()
        } else {
            incident.repository.as_str()
        };
        if transition.previous == IncidentStatus::Pending {
            self.coordinator.withdraw(repository, &incident.id);
        } else if transition.previous.holds_dispatch_slot() && !incident.status.holds_dispatch_slot() {
            self.coordinator.release(repository);
        }
        Ok(incident)
    }

    pub fn purge_expired(&self, retention: Duration) -> Result<usize, ServiceError> {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|r| Utc::now().checked_sub_signed(r))
        else {
            return Ok(0);
        };
        let removed = self.store.purge_older_than(cutoff)?;
        if removed > 0 {
            info!(removed, cutoff = %cutoff, "expired incidents purged");
        }
        Ok(removed)
    }
}

/// Periodically purges incidents older than `retention`.
pub fn spawn_retention_sweeper(
    service: IncidentService,
    retention: Duration,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            if let Err(err) = service.purge_expired(retention) {
                error!(error = %err, "retention purge failed");
            }
        }
    })
}
