//! Operator configuration: service-to-repository mappings and custom rules.
//!
//! The active configuration is an immutable snapshot. Reloads build and
//! validate a complete new snapshot before swapping it in, so a broken file
//! never replaces a working one.

use crate::error::ConfigError;
use crate::rules::{CustomRule, RuleEngine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tracing::{error, info, warn};

fn default_branch() -> String {
    "main".into()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceMapping {
    pub repository: String,
    #[serde(default = "default_branch")]
    pub branch: String,
}

/// On-disk shape of the operator file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub service_mappings: BTreeMap<String, ServiceMapping>,
    #[serde(default)]
    pub rules: Vec<CustomRule>,
}

#[derive(Clone, Debug, Default)]
pub struct RuntimeConfig {
    pub service_mappings: BTreeMap<String, ServiceMapping>,
    pub rules: RuleEngine,
}

impl RuntimeConfig {
    pub fn from_file(file: ConfigFile) -> Result<Self, ConfigError> {
        if let Some((service, _)) = file
            .service_mappings
            .iter()
            .find(|(_, m)| m.repository.trim().is_empty())
        {
            return Err(ConfigError::EmptyRepository(service.clone()));
        }

        Ok(Self {
            service_mappings: file.service_mappings,
            rules: RuleEngine::new(file.rules)?,
        })
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_yaml::from_str(text)?;
        Self::from_file(file)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn mapping_for(&self, service: &str) -> Option<&ServiceMapping> {
        self.service_mappings.get(service)
    }
}

/// Shared, swappable view of the active [`RuntimeConfig`].
#[derive(Clone, Default)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<RuntimeConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn current(&self) -> Arc<RuntimeConfig> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn replace(&self, config: RuntimeConfig) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(config);
    }

    /// Loads `path` and activates it. On error the previous snapshot stays.
    pub fn reload_from(&self, path: &Path) -> Result<(), ConfigError> {
        let config = RuntimeConfig::load(path)?;
        info!(
            path = %path.display(),
            mappings = config.service_mappings.len(),
            rules = config.rules.rules().count(),
            "configuration loaded"
        );
        self.replace(config);
        Ok(())
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Polls `path` and reloads it whenever its modification time changes.
pub fn spawn_config_watcher(
    handle: ConfigHandle,
    path: PathBuf,
    poll: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_seen = modified_at(&path);
        let mut ticker = tokio::time::interval(poll);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(modified) = modified_at(&path) else {
                warn!(path = %path.display(), "config file not readable, keeping current configuration");
                continue;
            };
            if last_seen == Some(modified) {
                continue;
            }
            last_seen = Some(modified);

            if let Err(err) = handle.reload_from(&path) {
                error!(path = %path.display(), error = %err, "config reload rejected, keeping previous configuration");
            }
        }
    })
}
