//! Admission-controlled dispatch of remediation jobs.
//!
//! Each target repository has a cap on concurrently running jobs. An incident
//! that finds the repository full waits in a FIFO queue; when a running job
//! reports completion its slot is released and the oldest queued incident is
//! dispatched in the background.
//!
//! Slot accounting per repository:
//! - `active` counts jobs that were triggered successfully and have not
//!   reported completion yet.
//! - `reserved` counts admissions whose trigger attempts are still running.
//!
//! Admission checks `active + reserved` against the cap and reserves in the
//! same critical section, so a repository can never be over-committed.

use crate::error::DispatchError;
use crate::store::{IncidentStore, StatusUpdate};
use crate::trigger::WorkflowTrigger;
use incident_model::{EventType, Incident, IncidentContext, IncidentStatus};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

pub const MAX_TRIGGER_ATTEMPTS: u32 = 3;

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    pub max_concurrent_per_repo: usize,
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for every attempt after it.
    pub base_backoff: Duration,
    pub attempt_timeout: Duration,
    /// Overall budget for one dispatch, backoff included.
    pub deadline: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_repo: 2,
            max_attempts: MAX_TRIGGER_ATTEMPTS,
            base_backoff: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(10),
            deadline: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Triggered { attempts: u32 },
    Queued { position: usize },
    Failed { attempts: u32, reason: String },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct RepoDispatchState {
    pub active: usize,
    pub in_flight: usize,
    pub queued: usize,
}

#[derive(Default)]
struct RepoSlots {
    active: usize,
    reserved: usize,
    queue: VecDeque<Incident>,
}

impl RepoSlots {
    fn occupied(&self) -> usize {
        self.active + self.reserved
    }
}

enum Admission {
    Granted(Incident),
    Queued(usize),
}

struct Inner {
    slots: Mutex<HashMap<String, RepoSlots>>,
    trigger: Arc<dyn WorkflowTrigger>,
    store: IncidentStore,
    config: DispatchConfig,
}

#[derive(Clone)]
pub struct DispatchCoordinator {
    inner: Arc<Inner>,
}

impl DispatchCoordinator {
    pub fn new(store: IncidentStore, trigger: Arc<dyn WorkflowTrigger>, config: DispatchConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(HashMap::new()),
                trigger,
                store,
                config,
            }),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.inner.config
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, RepoSlots>> {
        self.inner.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admits `incident` for its repository or queues it, then runs the
    /// trigger attempts under the configured deadline.
    pub async fn dispatch(&self, incident: Incident) -> DispatchOutcome {
        let deadline = Instant::now() + self.inner.config.deadline;
        self.dispatch_until(incident, deadline).await
    }

    /// Like [`dispatch`](Self::dispatch) with an explicit deadline. Reaching
    /// the deadline aborts any pending backoff.
    pub async fn dispatch_until(&self, incident: Incident, deadline: Instant) -> DispatchOutcome {
        match self.admit(incident) {
            Admission::Queued(position) => DispatchOutcome::Queued { position },
            Admission::Granted(incident) => self.run_attempts(incident, deadline).await,
        }
    }

    fn admit(&self, incident: Incident) -> Admission {
        let max = self.inner.config.max_concurrent_per_repo;
        let repository = incident.repository.clone();
        let mut slots = self.slots();
        let entry = slots.entry(repository.clone()).or_default();

        if entry.occupied() >= max {
            info!(
                incident_id = %incident.id,
                repository = %repository,
                active = entry.active,
                queued = entry.queue.len() + 1,
                "repository at capacity, incident queued"
            );
            entry.queue.push_back(incident);
            let position = entry.queue.len();
            publish_gauges(&repository, entry);
            metrics::counter!("dispatch_total", "repository" => repository, "outcome" => "queued")
                .increment(1);
            return Admission::Queued(position);
        }

        entry.reserved += 1;
        Admission::Granted(incident)
    }

    async fn run_attempts(&self, incident: Incident, deadline: Instant) -> DispatchOutcome {
        let started = Instant::now();
        let repository = incident.repository.clone();
        let context = IncidentContext::from(&incident);
        let attempts = AtomicU32::new(0);

        let result = tokio::time::timeout_at(deadline, self.attempt_loop(&context, &attempts)).await;
        let attempts = attempts.load(Ordering::SeqCst);
        metrics::histogram!("dispatch_latency_seconds", "repository" => repository.clone())
            .record(started.elapsed().as_secs_f64());

        let failure = match result {
            Ok(Ok(run_id)) => {
                match self.inner.store.mark_triggered(&incident.id, run_id, attempts) {
                    Ok(_) => {
                        self.confirm(&repository);
                        info!(incident_id = %incident.id, repository = %repository, attempts, "remediation workflow triggered");
                        metrics::counter!("dispatch_total", "repository" => repository, "outcome" => "triggered")
                            .increment(1);
                        return DispatchOutcome::Triggered { attempts };
                    }
                    Err(err) => {
                        error!(incident_id = %incident.id, repository = %repository, error = %err, "failed to record trigger");
                        self.release_reservation(&repository);
                        return DispatchOutcome::Failed {
                            attempts,
                            reason: err.to_string(),
                        };
                    }
                }
            }
            Ok(Err(err)) => format!("dispatch failed after {attempts} attempts: {err}"),
            Err(_) => format!("dispatch deadline exceeded after {attempts} attempts"),
        };

        warn!(incident_id = %incident.id, repository = %repository, attempts, reason = %failure, "dispatch exhausted");
        metrics::counter!("dispatch_total", "repository" => repository.clone(), "outcome" => "failed")
            .increment(1);

        let update = StatusUpdate {
            diagnosis: Some(failure.clone()),
            data: Some(serde_json::json!({ "attempts": attempts })),
            ..StatusUpdate::default()
        };
        if let Err(err) = self
            .inner
            .store
            .transition(&incident.id, IncidentStatus::Failed, update)
        {
            error!(incident_id = %incident.id, error = %err, "failed to record dispatch failure");
        }
        self.release_reservation(&repository);

        DispatchOutcome::Failed {
            attempts,
            reason: failure,
        }
    }

    async fn attempt_loop(
        &self,
        context: &IncidentContext,
        attempts: &AtomicU32,
    ) -> Result<Option<String>, DispatchError> {
        let config = &self.inner.config;
        let mut last_error = DispatchError::Other("no attempts made".into());

        for attempt in 1..=config.max_attempts.max(1) {
            if attempt > 1 {
                let backoff = config.base_backoff * 2u32.pow(attempt - 2);
                tokio::time::sleep(backoff).await;
            }
            attempts.store(attempt, Ordering::SeqCst);

            let outcome = tokio::time::timeout(config.attempt_timeout, self.inner.trigger.trigger(context))
                .await
                .unwrap_or(Err(DispatchError::Timeout));
            let label = if outcome.is_ok() { "success" } else { "failure" };
            metrics::counter!("dispatch_attempts_total", "repository" => context.repository.clone(), "outcome" => label)
                .increment(1);

            match outcome {
                Ok(run_id) => return Ok(run_id),
                Err(err) => {
                    warn!(
                        incident_id = %context.incident_id,
                        repository = %context.repository,
                        attempt,
                        error = %err,
                        "workflow trigger attempt failed"
                    );
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    /// Turns a reservation into an active job.
    fn confirm(&self, repository: &str) {
        let mut slots = self.slots();
        let entry = slots.entry(repository.to_string()).or_default();
        entry.reserved = entry.reserved.saturating_sub(1);
        entry.active += 1;
        publish_gauges(repository, entry);
    }

    fn release_reservation(&self, repository: &str) {
        let next = {
            let mut slots = self.slots();
            let entry = slots.entry(repository.to_string()).or_default();
            entry.reserved = entry.reserved.saturating_sub(1);
            self.take_next(repository, entry)
        };
        if let Some(incident) = next {
            self.spawn_dequeued(incident);
        }
    }

    /// Frees the slot of a completed job. If incidents are waiting for the
    /// repository, the oldest one is dispatched on a background task.
    pub fn release(&self, repository: &str) {
        let next = {
            let mut slots = self.slots();
            let entry = slots.entry(repository.to_string()).or_default();
            entry.active = entry.active.saturating_sub(1);
            self.take_next(repository, entry)
        };
        if let Some(incident) = next {
            self.spawn_dequeued(incident);
        }
    }

    fn take_next(&self, repository: &str, entry: &mut RepoSlots) -> Option<Incident> {
        let next = if entry.occupied() < self.inner.config.max_concurrent_per_repo {
            entry.queue.pop_front()
        } else {
            None
        };
        if next.is_some() {
            entry.reserved += 1;
        }
        publish_gauges(repository, entry);
        next
    }

    /// Removes a queued incident that no longer needs a workflow, for example
    /// one failed by a callback while it was waiting. Returns whether it was
    /// still queued.
    pub fn withdraw(&self, repository: &str, incident_id: &str) -> bool {
        let mut slots = self.slots();
        let Some(entry) = slots.get_mut(repository) else {
            return false;
        };
        let queued = entry.queue.len();
        entry.queue.retain(|waiting| waiting.id != incident_id);
        let removed = entry.queue.len() < queued;
        if removed {
            publish_gauges(repository, entry);
            info!(incident_id, repository, "queued incident withdrawn");
        }
        removed
    }

    /// Skips dequeued incidents that are no longer pending in the store,
    /// handing their reservation on to the next one in line.
    fn still_pending(&self, mut incident: Incident) -> Option<Incident> {
        loop {
            match self.inner.store.get(&incident.id) {
                Ok(Some(stored)) if stored.status != IncidentStatus::Pending => {
                    info!(incident_id = %incident.id, status = %stored.status, "dequeued incident is no longer pending, skipped");
                }
                Ok(None) => {
                    info!(incident_id = %incident.id, "dequeued incident no longer exists, skipped");
                }
                Ok(Some(_)) => return Some(incident),
                Err(err) => {
                    warn!(incident_id = %incident.id, error = %err, "could not re-read dequeued incident");
                    return Some(incident);
                }
            }

            let repository = incident.repository.clone();
            let mut slots = self.slots();
            let entry = slots.entry(repository.clone()).or_default();
            entry.reserved = entry.reserved.saturating_sub(1);
            incident = self.take_next(&repository, entry)?;
        }
    }

    fn spawn_dequeued(&self, incident: Incident) {
        let Some(incident) = self.still_pending(incident) else {
            return;
        };
        if let Err(err) = self.inner.store.record_event(
            &incident.id,
            EventType::DequeuedForRemediation,
            Some(serde_json::json!({ "repository": incident.repository })),
        ) {
            error!(incident_id = %incident.id, error = %err, "failed to record dequeue event");
        }
        info!(incident_id = %incident.id, repository = %incident.repository, "dequeued for remediation");

        let coordinator = self.clone();
        tokio::spawn(async move {
            let deadline = Instant::now() + coordinator.inner.config.deadline;
            coordinator.run_attempts(incident, deadline).await;
        });
    }

    pub fn active_count(&self, repository: &str) -> usize {
        self.slots().get(repository).map_or(0, |s| s.active)
    }

    pub fn queued_count(&self, repository: &str) -> usize {
        self.slots().get(repository).map_or(0, |s| s.queue.len())
    }

    pub fn snapshot(&self) -> BTreeMap<String, RepoDispatchState> {
        self.slots()
            .iter()
            .map(|(repo, s)| {
                (
                    repo.clone(),
                    RepoDispatchState {
                        active: s.active,
                        in_flight: s.reserved,
                        queued: s.queue.len(),
                    },
                )
            })
            .collect()
    }
}

fn publish_gauges(repository: &str, slots: &RepoSlots) {
    metrics::gauge!("dispatch_active", "repository" => repository.to_string()).set(slots.active as f64);
    metrics::gauge!("dispatch_queued", "repository" => repository.to_string()).set(slots.queue.len() as f64);
}
