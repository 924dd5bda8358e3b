use crate::error::StoreError;
use crate::store::{CreateOutcome, IncidentStore};
use incident_model::Incident;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Collapses repeats of the same service + error message inside a window.
#[derive(Clone, Copy, Debug)]
pub struct DedupFilter {
    window: Duration,
}

impl Default for DedupFilter {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}

impl DedupFilter {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Stores `incident` unless it duplicates a recent one. The check and the
    /// insert are a single store transaction.
    pub fn admit(&self, store: &IncidentStore, incident: &Incident) -> Result<CreateOutcome, StoreError> {
        let outcome = store.create_or_correlate(incident, self.window)?;
        if let CreateOutcome::Duplicate { existing_id } = &outcome {
            info!(
                incident_id = %existing_id,
                service = %incident.service_name,
                provider = %incident.source,
                "duplicate incident suppressed"
            );
            metrics::counter!("incidents_duplicate_total", "provider" => incident.source.as_str())
                .increment(1);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::IncidentFilter;
    use incident_model::Provider;

    #[test]
    fn identical_signals_within_window_leave_one_row() {
        let store = IncidentStore::open_in_memory().expect("open");
        let filter = DedupFilter::default();

        let first = Incident::new(Provider::Datadog, "api", "503 from upstream");
        let second = Incident::new(Provider::PagerDuty, "api", "503 from upstream");
        assert_eq!(filter.admit(&store, &first).expect("first"), CreateOutcome::Created);
        assert!(matches!(
            filter.admit(&store, &second).expect("second"),
            CreateOutcome::Duplicate { .. }
        ));

        assert_eq!(store.list(&IncidentFilter::default()).expect("list").len(), 1);
    }

    #[test]
    fn different_error_messages_are_distinct() {
        let store = IncidentStore::open_in_memory().expect("open");
        let filter = DedupFilter::default();

        for message in ["503 from upstream", "504 from upstream"] {
            let incident = Incident::new(Provider::Datadog, "api", message);
            assert_eq!(filter.admit(&store, &incident).expect("admit"), CreateOutcome::Created);
        }
    }

    #[test]
    fn zero_window_disables_suppression() {
        let store = IncidentStore::open_in_memory().expect("open");
        let filter = DedupFilter::new(Duration::ZERO);

        for _ in 0..2 {
            let incident = Incident::new(Provider::Datadog, "api", "same");
            assert_eq!(filter.admit(&store, &incident).expect("admit"), CreateOutcome::Created);
        }
    }
}
