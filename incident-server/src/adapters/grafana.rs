use super::{
    base_metadata, extract_stack_trace, parse_object, str_at, AdapterError, IncidentAdapter,
    SignatureCheck,
};
use axum::http::HeaderMap;
use incident_model::{Incident, Provider, Severity, UNKNOWN_SERVICE};
use serde_json::Value;

pub const SIGNATURE_HEADER: &str = "x-grafana-alerting-signature";

/// Grafana unified alerting webhooks. The first firing alert in the group
/// becomes the incident.
///
/// Severity from the `severity` label: `critical`; `high`/`error` high;
/// `medium`/`warning` medium; `low`/`info` low. Service from the `service`,
/// `job` or `app` label, in that order.
pub struct GrafanaAdapter {
    signature: SignatureCheck,
}

impl GrafanaAdapter {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            signature: SignatureCheck::new(SIGNATURE_HEADER, secret),
        }
    }
}

fn severity(labels: Option<&Value>) -> Severity {
    let label = labels
        .and_then(|l| str_at(l, &["severity"]))
        .unwrap_or_default()
        .to_ascii_lowercase();
    match label.as_str() {
        "critical" => Severity::Critical,
        "high" | "error" => Severity::High,
        "low" | "info" => Severity::Low,
        _ => Severity::Medium,
    }
}

impl IncidentAdapter for GrafanaAdapter {
    fn provider(&self) -> Provider {
        Provider::Grafana
    }

    fn validate(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), AdapterError> {
        self.signature.verify(headers, body)
    }

    fn parse(&self, body: &[u8]) -> Result<Incident, AdapterError> {
        let payload = Value::Object(parse_object(body)?);

        let status = str_at(&payload, &["status"]).ok_or(AdapterError::MissingField("status"))?;
        if status != "firing" {
            return Err(AdapterError::IgnoredEvent(format!("grafana alert status '{status}'")));
        }
        if let Some(state) = str_at(&payload, &["state"]).filter(|s| *s != "alerting") {
            return Err(AdapterError::IgnoredEvent(format!("grafana alert state '{state}'")));
        }

        let alerts = payload
            .get("alerts")
            .and_then(Value::as_array)
            .ok_or(AdapterError::MissingField("alerts"))?;
        let alert = alerts
            .iter()
            .find(|a| str_at(a, &["status"]).map_or(true, |s| s == "firing"))
            .ok_or(AdapterError::MissingField("alerts[firing]"))?;

        let labels = alert.get("labels");
        let annotations = alert.get("annotations");
        let service = labels
            .and_then(|l| {
                str_at(l, &["service"])
                    .or_else(|| str_at(l, &["job"]))
                    .or_else(|| str_at(l, &["app"]))
            })
            .unwrap_or(UNKNOWN_SERVICE);
        let message = annotations
            .and_then(|a| str_at(a, &["summary"]).or_else(|| str_at(a, &["description"])))
            .or_else(|| labels.and_then(|l| str_at(l, &["alertname"])))
            .or_else(|| str_at(&payload, &["title"]))
            .ok_or(AdapterError::MissingField("alerts[].annotations.summary"))?;
        let details = annotations
            .and_then(|a| str_at(a, &["description"]))
            .or_else(|| str_at(&payload, &["message"]));

        let mut metadata = base_metadata(
            str_at(alert, &["fingerprint"]).map(ToString::to_string),
            payload.clone(),
        );
        if let Some(labels) = labels {
            metadata.insert("labels".into(), labels.clone());
        }

        Ok(Incident::new(Provider::Grafana, service, message)
            .with_severity(severity(labels))
            .with_stack_trace(details.and_then(extract_stack_trace))
            .with_metadata(metadata))
    }
}
