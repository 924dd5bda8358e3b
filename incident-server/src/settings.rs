//! Process settings read from the environment.

use crate::adapters::ProviderSecrets;
use incident_core::{DispatchConfig, HttpTriggerConfig};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[error("invalid value '{value}' for {var}")]
pub struct SettingsError {
    pub var: &'static str,
    pub value: String,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub database_path: PathBuf,
    pub config_path: Option<PathBuf>,
    pub config_poll: Duration,
    pub dedup_window: Duration,
    /// `None` disables the retention sweep.
    pub retention: Option<Duration>,
    pub dispatch: DispatchConfig,
    pub trigger: HttpTriggerConfig,
    pub secrets: ProviderSecrets,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".into(),
            database_path: PathBuf::from("incidents.db"),
            config_path: None,
            config_poll: Duration::from_secs(5),
            dedup_window: Duration::from_secs(300),
            retention: Some(Duration::from_secs(90 * DAY_SECS)),
            dispatch: DispatchConfig::default(),
            trigger: HttpTriggerConfig::default(),
            secrets: ProviderSecrets::default(),
        }
    }
}

const DAY_SECS: u64 = 24 * 60 * 60;

fn days(n: u64) -> Option<Duration> {
    n.checked_mul(DAY_SECS).map(Duration::from_secs)
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(addr) = get("BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(path) = get("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        config.config_path = get("INCIDENT_CONFIG").map(PathBuf::from);

        if let Some(secs) = parsed::<u64>(&get, "CONFIG_POLL_SECS")? {
            config.config_poll = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parsed::<u64>(&get, "DEDUP_WINDOW_SECS")? {
            config.dedup_window = Duration::from_secs(secs);
        }
        if let Some(n) = parsed::<u64>(&get, "RETENTION_DAYS")? {
            config.retention = match n {
                0 => None,
                n => Some(days(n).ok_or_else(|| SettingsError {
                    var: "RETENTION_DAYS",
                    value: n.to_string(),
                })?),
            };
        }
        if let Some(max) = parsed::<usize>(&get, "MAX_CONCURRENT_PER_REPO")? {
            config.dispatch.max_concurrent_per_repo = max.max(1);
        }
        if let Some(secs) = parsed::<u64>(&get, "DISPATCH_ATTEMPT_TIMEOUT_SECS")? {
            config.dispatch.attempt_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parsed::<u64>(&get, "DISPATCH_DEADLINE_SECS")? {
            config.dispatch.deadline = Duration::from_secs(secs.max(1));
        }
        config.trigger.attempt_timeout = config.dispatch.attempt_timeout;

        if let Some(url) = get("WORKFLOW_API_URL") {
            config.trigger.api_url = url;
        }
        config.trigger.token = get("WORKFLOW_TOKEN");
        if let Some(event_type) = get("WORKFLOW_EVENT_TYPE") {
            config.trigger.event_type = event_type;
        }

        config.secrets = ProviderSecrets {
            datadog: get("DATADOG_WEBHOOK_SECRET"),
            pagerduty: get("PAGERDUTY_WEBHOOK_SECRET"),
            grafana: get("GRAFANA_WEBHOOK_SECRET"),
            sentry: get("SENTRY_WEBHOOK_SECRET"),
        };
        Ok(config)
    }
}

fn parsed<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, SettingsError> {
    get(var)
        .map(|value| value.parse::<T>().map_err(|_| SettingsError { var, value }))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(pairs: &[(&str, &str)]) -> Result<ServerConfig, SettingsError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = from(&[]).expect("defaults");
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.dedup_window, Duration::from_secs(300));
        assert_eq!(config.dispatch.max_concurrent_per_repo, 2);
        assert_eq!(config.dispatch.deadline, Duration::from_secs(30));
        assert_eq!(config.retention, days(90));
        assert!(config.config_path.is_none());
        assert!(config.secrets.datadog.is_none());
    }

    #[test]
    fn overrides_are_read() {
        let config = from(&[
            ("MAX_CONCURRENT_PER_REPO", "4"),
            ("RETENTION_DAYS", "0"),
            ("DISPATCH_ATTEMPT_TIMEOUT_SECS", "3"),
            ("WORKFLOW_TOKEN", "ghp_x"),
            ("SENTRY_WEBHOOK_SECRET", "shh"),
            ("INCIDENT_CONFIG", "/etc/incidents.yaml"),
        ])
        .expect("config");
        assert_eq!(config.dispatch.max_concurrent_per_repo, 4);
        assert_eq!(config.retention, None);
        assert_eq!(config.trigger.attempt_timeout, Duration::from_secs(3));
        assert_eq!(config.trigger.token.as_deref(), Some("ghp_x"));
        assert_eq!(config.secrets.sentry.as_deref(), Some("shh"));
        assert_eq!(config.config_path, Some(PathBuf::from("/etc/incidents.yaml")));
    }

    #[test]
    fn malformed_number_names_the_variable() {
        let err = from(&[("DEDUP_WINDOW_SECS", "five")]).expect_err("invalid");
        assert_eq!(err.var, "DEDUP_WINDOW_SECS");
        assert_eq!(err.value, "five");
    }

    #[test]
    fn retention_too_large_to_represent_is_rejected() {
        let err = from(&[("RETENTION_DAYS", "18446744073709551615")]).expect_err("overflow");
        assert_eq!(err.var, "RETENTION_DAYS");
        assert_eq!(err.value, "18446744073709551615");

        let config = from(&[("RETENTION_DAYS", "3650")]).expect("ten years");
        assert_eq!(config.retention, Some(Duration::from_secs(3650 * 86_400)));
    }
}
