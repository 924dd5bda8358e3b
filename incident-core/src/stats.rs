use incident_model::{Incident, IncidentStatus};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IncidentStatistics {
    pub total: u64,
    /// Incidents with status `resolved` or `pr_created`.
    pub resolved: u64,
    pub failed: u64,
    /// `resolved / total`, or 0 when there are no incidents.
    pub success_rate: f64,
    /// Mean of `completed_at - created_at` in seconds over resolved incidents
    /// that carry both timestamps; 0 when none do.
    pub mean_time_to_resolve_secs: f64,
}

pub fn compute_statistics<'a>(incidents: impl IntoIterator<Item = &'a Incident>) -> IncidentStatistics {
    let mut stats = IncidentStatistics::default();
    let mut resolve_total_secs = 0.0;
    let mut resolve_samples = 0u64;

    for incident in incidents {
        stats.total += 1;
        if incident.status == IncidentStatus::Failed {
            stats.failed += 1;
        }
        if !incident.status.counts_as_resolved() {
            continue;
        }
        stats.resolved += 1;
        if let Some(completed_at) = incident.completed_at {
            let elapsed = completed_at - incident.created_at;
            resolve_total_secs += elapsed.num_milliseconds() as f64 / 1000.0;
            resolve_samples += 1;
        }
    }

    if stats.total > 0 {
        stats.success_rate = stats.resolved as f64 / stats.total as f64;
    }
    if resolve_samples > 0 {
        stats.mean_time_to_resolve_secs = resolve_total_secs / resolve_samples as f64;
    }
    stats
}
