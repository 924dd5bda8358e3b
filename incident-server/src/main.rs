use incident_core::{
    spawn_config_watcher, spawn_retention_sweeper, ConfigHandle, DedupFilter, DispatchCoordinator,
    HttpWorkflowTrigger, IncidentService, IncidentStore, RuntimeConfig,
};
use incident_server::adapters::AdapterRegistry;
use incident_server::{router, telemetry, AppState, ServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const RETENTION_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init_tracing();
    let settings = ServerConfig::from_env()?;

    let store = IncidentStore::open(&settings.database_path)?;
    info!(path = %settings.database_path.display(), "incident store opened");

    let runtime = match &settings.config_path {
        Some(path) => RuntimeConfig::load(path).unwrap_or_else(|err| {
            error!(path = %path.display(), error = %err, "config load failed, starting with no mappings or rules");
            RuntimeConfig::default()
        }),
        None => {
            warn!("INCIDENT_CONFIG not set, every service will require manual setup");
            RuntimeConfig::default()
        }
    };
    let config = ConfigHandle::new(runtime);
    if let Some(path) = settings.config_path.clone() {
        spawn_config_watcher(config.clone(), path, settings.config_poll);
    }

    let trigger = HttpWorkflowTrigger::new(settings.trigger.clone())?;
    let coordinator = DispatchCoordinator::new(store.clone(), Arc::new(trigger), settings.dispatch.clone());
    let service = IncidentService::new(
        store,
        config,
        DedupFilter::new(settings.dedup_window),
        coordinator,
    );

    if let Some(retention) = settings.retention {
        spawn_retention_sweeper(service.clone(), retention, RETENTION_INTERVAL);
    }

    let mut state = AppState::new(service, AdapterRegistry::with_builtin(&settings.secrets));
    match telemetry::install_metrics_recorder() {
        Ok(handle) => state = state.with_metrics(handle),
        Err(err) => warn!(error = %err, "metrics recorder not installed"),
    }

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    info!(addr = %settings.bind_addr, "incident-server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
