//! Incident ingestion, classification, storage and remediation dispatch.

pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod pipeline;
pub mod rules;
pub mod runner;
pub mod stats;
pub mod store;
pub mod trigger;

pub use config::{spawn_config_watcher, ConfigHandle, RuntimeConfig, ServiceMapping};
pub use dedup::DedupFilter;
pub use dispatch::{DispatchConfig, DispatchCoordinator, DispatchOutcome, RepoDispatchState};
pub use error::{ConfigError, DispatchError, RuleError, ServiceError, StoreError};
pub use pipeline::{spawn_retention_sweeper, Disposition, IncidentService, IngestOutcome};
pub use rules::{CustomRule, RuleEngine, RuleMatch};
pub use runner::{StatusReporter, WorkflowStatusReport};
pub use stats::IncidentStatistics;
pub use store::{IncidentFilter, IncidentStore};
pub use trigger::{HttpTriggerConfig, HttpWorkflowTrigger, WorkflowTrigger};
