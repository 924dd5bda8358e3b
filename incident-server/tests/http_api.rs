use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use incident_core::{
    ConfigHandle, DedupFilter, DispatchConfig, DispatchCoordinator, DispatchError, IncidentService,
    IncidentStore, RuntimeConfig, WorkflowTrigger,
};
use incident_model::IncidentContext;
use incident_server::adapters::{sign_hex, AdapterRegistry, ProviderSecrets};
use incident_server::{router, AppState};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const CONFIG: &str = r#"
service_mappings:
  checkout:
    repository: acme/checkout
  payments:
    repository: acme/payments
    branch: release
rules:
  - name: page-on-payments
    conditions:
      service_name: payments
    actions:
      set_severity: critical
"#;

#[derive(Default)]
struct CountingTrigger {
    calls: AtomicUsize,
}

#[async_trait]
impl WorkflowTrigger for CountingTrigger {
    async fn trigger(&self, _context: &IncidentContext) -> Result<Option<String>, DispatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some("run-1".into()))
    }
}

struct Harness {
    app: Router,
    service: IncidentService,
    trigger: Arc<CountingTrigger>,
}

fn harness_with(secrets: ProviderSecrets, max: usize) -> Harness {
    harness_on(IncidentStore::open_in_memory().expect("store"), secrets, max)
}

fn harness_on(store: IncidentStore, secrets: ProviderSecrets, max: usize) -> Harness {
    let trigger = Arc::new(CountingTrigger::default());
    let coordinator = DispatchCoordinator::new(
        store.clone(),
        trigger.clone(),
        DispatchConfig {
            max_concurrent_per_repo: max,
            ..DispatchConfig::default()
        },
    );
    let config = ConfigHandle::new(RuntimeConfig::from_yaml(CONFIG).expect("config"));
    let service = IncidentService::new(store, config, DedupFilter::default(), coordinator);
    let app = router(AppState::new(
        service.clone(),
        AdapterRegistry::with_builtin(&secrets),
    ));
    Harness { app, service, trigger }
}

fn harness() -> Harness {
    harness_with(ProviderSecrets::default(), 2)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).expect("request")
}

fn datadog_alert(service: &str, title: &str) -> Value {
    json!({
        "id": 77,
        "title": title,
        "alert_type": "error",
        "tags": format!("env:prod,service:{service}"),
        "transition": "Triggered"
    })
}

async fn wait_for_status(service: &IncidentService, id: &str, status: &str) {
    for _ in 0..200 {
        let incident = service.store().get(id).expect("get").expect("present");
        if incident.status.as_str() == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("incident {id} never reached {status}");
}

#[tokio::test]
async fn webhook_is_accepted_and_dispatched() {
    let h = harness();
    let (status, body) = send(
        &h.app,
        post_json("/webhooks/incidents?provider=datadog", &datadog_alert("checkout", "500s on /pay")),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "accepted");
    let id = body["incident_id"].as_str().expect("id").to_string();
    assert!(id.starts_with("datadog-"));

    wait_for_status(&h.service, &id, "workflow_triggered").await;
    assert_eq!(h.trigger.calls.load(Ordering::SeqCst), 1);

    let (status, body) = send(&h.app, get(&format!("/incidents/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["incident"]["repository"], "acme/checkout");
    assert_eq!(body["incident"]["workflow_run_id"], "run-1");
    let events: Vec<&str> = body["events"]
        .as_array()
        .expect("events")
        .iter()
        .filter_map(|e| e["event_type"].as_str())
        .collect();
    assert_eq!(events, vec!["received", "workflow_triggered"]);
}

#[tokio::test]
async fn unknown_provider_is_bad_request() {
    let h = harness();
    let (status, body) = send(
        &h.app,
        post_json("/webhooks/incidents?provider=newrelic", &json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().expect("error").contains("newrelic"));

    let (status, _) = send(&h.app, post_json("/webhooks/incidents", &json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_payload_is_bad_request() {
    let h = harness();
    let request = Request::post("/webhooks/incidents?provider=sentry")
        .body(Body::from("not json"))
        .expect("request");
    let (status, _) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(h
        .service
        .store()
        .list(&Default::default())
        .expect("list")
        .is_empty());
}

#[tokio::test]
async fn signature_is_enforced_when_secret_configured() {
    let h = harness_with(
        ProviderSecrets {
            datadog: Some("dd-secret".into()),
            ..ProviderSecrets::default()
        },
        2,
    );
    let body = datadog_alert("checkout", "timeouts").to_string();

    let unsigned = Request::post("/webhooks/incidents?provider=datadog")
        .body(Body::from(body.clone()))
        .expect("request");
    let (status, _) = send(&h.app, unsigned).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let signed = Request::post("/webhooks/incidents?provider=datadog")
        .header("x-datadog-signature", sign_hex("dd-secret", body.as_bytes()))
        .body(Body::from(body))
        .expect("request");
    let (status, _) = send(&h.app, signed).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn duplicate_webhook_reports_existing_incident() {
    let h = harness();
    let alert = datadog_alert("billing", "ledger mismatch");
    let (_, first) = send(&h.app, post_json("/webhooks/incidents?provider=datadog", &alert)).await;
    let (status, second) = send(&h.app, post_json("/webhooks/incidents?provider=datadog", &alert)).await;

    assert_eq!(first["status"], "requires_manual_setup");
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(second["status"], "duplicate");
    assert_eq!(second["incident_id"], first["incident_id"]);
}

#[tokio::test]
async fn workflow_status_completes_incident() {
    let h = harness();
    let (_, body) = send(
        &h.app,
        post_json("/webhooks/incidents?provider=datadog", &datadog_alert("payments", "card declined loop")),
    )
    .await;
    let id = body["incident_id"].as_str().expect("id").to_string();
    wait_for_status(&h.service, &id, "workflow_triggered").await;
    assert_eq!(h.service.coordinator().active_count("acme/payments"), 1);

    let (status, body) = send(
        &h.app,
        post_json(
            "/webhooks/workflow-status",
            &json!({
                "incident_id": id,
                "status": "success",
                "pr_url": "https://example.test/acme/payments/pull/3",
                "diagnosis": "retry loop never backed off",
                "repository": "acme/payments"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["incident_status"], "pr_created");
    assert_eq!(h.service.coordinator().active_count("acme/payments"), 0);

    let (_, stats) = send(&h.app, get("/stats")).await;
    assert_eq!(stats["total"], 1);
    assert_eq!(stats["resolved"], 1);
    assert_eq!(stats["success_rate"], 1.0);

    let (status, _) = send(
        &h.app,
        post_json(
            "/webhooks/workflow-status",
            &json!({ "incident_id": id, "status": "in_progress", "repository": "acme/payments" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn ingest_is_unavailable_when_the_store_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("incidents.db");
    let h = harness_on(IncidentStore::open(&path).expect("store"), ProviderSecrets::default(), 2);

    rusqlite::Connection::open(&path)
        .expect("second connection")
        .execute_batch("DROP TABLE incident_events; DROP TABLE incidents;")
        .expect("drop tables");

    let (status, body) = send(
        &h.app,
        post_json("/webhooks/incidents?provider=datadog", &datadog_alert("checkout", "disk full")),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"]
        .as_str()
        .expect("error")
        .contains("incident store unavailable"));
    assert_eq!(h.trigger.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn workflow_status_rejects_unknown_status() {
    let h = harness();
    let (_, body) = send(
        &h.app,
        post_json("/webhooks/incidents?provider=datadog", &datadog_alert("checkout", "stuck consumer")),
    )
    .await;
    let id = body["incident_id"].as_str().expect("id").to_string();
    wait_for_status(&h.service, &id, "workflow_triggered").await;

    let (status, body) = send(
        &h.app,
        post_json(
            "/webhooks/workflow-status",
            &json!({ "incident_id": id, "status": "succes", "repository": "acme/checkout" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().expect("error").contains("succes"));

    let (_, body) = send(&h.app, get(&format!("/incidents/{id}"))).await;
    assert_eq!(body["incident"]["status"], "workflow_triggered");
}

#[tokio::test]
async fn workflow_status_validates_request() {
    let h = harness();
    let (status, body) = send(
        &h.app,
        post_json("/webhooks/workflow-status", &json!({ "incident_id": "datadog-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().expect("error").contains("repository"));

    let (status, _) = send(
        &h.app,
        post_json(
            "/webhooks/workflow-status",
            &json!({ "incident_id": "datadog-nope", "status": "failed", "repository": "acme/x" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_filters_by_service_and_status() {
    let h = harness();
    for (service, title) in [("billing", "a"), ("billing", "b"), ("search", "c")] {
        send(
            &h.app,
            post_json("/webhooks/incidents?provider=datadog", &datadog_alert(service, title)),
        )
        .await;
    }

    let (status, body) = send(&h.app, get("/incidents?service=billing&status=requires_manual_setup")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);

    let (_, body) = send(&h.app, get("/incidents?limit=1")).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["incidents"][0]["error_message"], "c");

    let (status, _) = send(&h.app, get("/incidents?start=yesterday")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_incident_is_not_found() {
    let h = harness();
    let (status, _) = send(&h.app, get("/incidents/sentry-missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn config_health_and_dispatch_views() {
    let h = harness();

    let (status, config) = send(&h.app, get("/config")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(config["service_mappings"]["payments"]["branch"], "release");
    assert_eq!(config["rules"][0]["name"], "page-on-payments");
    assert_eq!(config["dispatch"]["max_concurrent_per_repo"], 2);
    assert_eq!(config["providers"], json!(["datadog", "grafana", "pagerduty", "sentry"]));

    let (status, health) = send(&h.app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health, json!({ "status": "ok", "database": "ok" }));

    let (status, dispatch) = send(&h.app, get("/dispatch")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dispatch["repositories"], json!({}));

    let response = h.app.clone().oneshot(get("/metrics")).await.expect("metrics");
    assert_eq!(response.status(), StatusCode::OK);
}
