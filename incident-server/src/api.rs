//! HTTP surface: webhook ingestion, the runner status callback and the
//! read-only query endpoints used by the dashboard.

use crate::adapters::{AdapterError, AdapterRegistry};
use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use incident_core::{IncidentFilter, IncidentService, ServiceError, StoreError, WorkflowStatusReport};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub service: IncidentService,
    pub adapters: Arc<AdapterRegistry>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(service: IncidentService, adapters: AdapterRegistry) -> Self {
        Self {
            service,
            adapters: Arc::new(adapters),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/incidents", post(ingest_incident))
        .route("/webhooks/workflow-status", post(workflow_status))
        .route("/incidents", get(list_incidents))
        .route("/incidents/:id", get(get_incident))
        .route("/stats", get(statistics))
        .route("/config", get(show_config))
        .route("/dispatch", get(dispatch_state))
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Validation(e) => ApiError::BadRequest(e.to_string()),
            ServiceError::BadRequest(msg) => ApiError::BadRequest(msg),
            ServiceError::NotFound(id) => ApiError::NotFound(format!("incident '{id}' not found")),
            ServiceError::Conflict(msg) => ApiError::Conflict(msg),
            ServiceError::Storage(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ServiceError::from(err).into()
    }
}

impl From<AdapterError> for ApiError {
    fn from(err: AdapterError) -> Self {
        if err.is_auth_failure() {
            ApiError::Unauthorized(err.to_string())
        } else {
            ApiError::BadRequest(err.to_string())
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

#[derive(Debug, Deserialize)]
struct ProviderQuery {
    provider: Option<String>,
}

fn reject(provider: &'static str, err: AdapterError) -> ApiError {
    warn!(provider, reason = err.reason(), error = %err, "webhook rejected");
    metrics::counter!("incidents_rejected_total", "provider" => provider, "reason" => err.reason())
        .increment(1);
    err.into()
}

async fn ingest_incident(
    State(state): State<AppState>,
    query: Result<Query<ProviderQuery>, QueryRejection>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Query(query) = query?;
    let requested = query.provider.unwrap_or_default();
    let adapter = state
        .adapters
        .get(&requested)
        .map_err(|err| reject("unsupported", err))?;
    let provider = adapter.provider_name();

    adapter
        .validate(&headers, &body)
        .map_err(|err| reject(provider, err))?;
    let incident = adapter.parse(&body).map_err(|err| reject(provider, err))?;

    let outcome = state.service.ingest(incident).await.map_err(|err| match err {
        ServiceError::Storage(e) => {
            error!(provider, error = %e, "incident store unavailable");
            ApiError::Unavailable(format!("incident store unavailable: {e}"))
        }
        other => {
            warn!(provider, error = %other, "incident rejected");
            other.into()
        }
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": outcome.disposition,
            "incident_id": outcome.incident_id,
        })),
    ))
}

async fn workflow_status(
    State(state): State<AppState>,
    payload: Result<Json<WorkflowStatusReport>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(report) = payload?;
    let reported = report.status.clone();
    let incident = state.service.complete_workflow(report).map_err(|err| {
        warn!(error = %err, status = %reported, "workflow status rejected");
        ApiError::from(err)
    })?;
    info!(incident_id = %incident.id, status = %incident.status, "workflow status applied");

    Ok(Json(json!({
        "status": "ok",
        "incident_id": incident.id,
        "incident_status": incident.status,
    })))
}

async fn list_incidents(
    State(state): State<AppState>,
    filter: Result<Query<IncidentFilter>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(filter) = filter?;
    let incidents = state.service.store().list(&filter)?;
    Ok(Json(json!({
        "count": incidents.len(),
        "incidents": incidents,
    })))
}

async fn get_incident(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let store = state.service.store();
    let incident = store
        .get(&id)?
        .ok_or_else(|| ApiError::NotFound(format!("incident '{id}' not found")))?;
    let events = store.events_for_incident(&id)?;
    Ok(Json(json!({ "incident": incident, "events": events })))
}

async fn statistics(
    State(state): State<AppState>,
    filter: Result<Query<IncidentFilter>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(filter) = filter?;
    let stats = state.service.store().statistics(&filter)?;
    Ok(Json(json!(stats)))
}

async fn show_config(State(state): State<AppState>) -> Json<Value> {
    let config = state.service.config().current();
    let dispatch = state.service.coordinator().config();
    let rules: Vec<Value> = config
        .rules
        .rules()
        .map(|r| json!({ "name": r.name, "enabled": r.enabled }))
        .collect();

    Json(json!({
        "service_mappings": config.service_mappings,
        "rules": rules,
        "providers": state.adapters.providers(),
        "dedup_window_secs": state.service.dedup_window().as_secs(),
        "dispatch": {
            "max_concurrent_per_repo": dispatch.max_concurrent_per_repo,
            "max_attempts": dispatch.max_attempts,
            "attempt_timeout_secs": dispatch.attempt_timeout.as_secs(),
            "deadline_secs": dispatch.deadline.as_secs(),
        },
    }))
}

async fn dispatch_state(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "repositories": state.service.coordinator().snapshot() }))
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.service.store().ping() {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "database": "ok" })),
        ),
        Err(err) => {
            error!(error = %err, "health check: database unreachable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "database": "unavailable" })),
            )
        }
    }
}

async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics.as_ref().map(PrometheusHandle::render).unwrap_or_default();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}
