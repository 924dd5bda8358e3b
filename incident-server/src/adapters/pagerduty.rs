use super::{
    base_metadata, extract_stack_trace, id_at, parse_object, str_at, AdapterError,
    IncidentAdapter, SignatureCheck,
};
use axum::http::HeaderMap;
use incident_model::{Incident, Provider, Severity, UNKNOWN_SERVICE};
use serde_json::Value;

pub const SIGNATURE_HEADER: &str = "x-pagerduty-signature";

/// PagerDuty v3 webhooks. Only `incident.triggered` events open incidents.
///
/// Severity: priority `P1` critical, `P2` high, `P3` medium, `P4`/`P5` low;
/// otherwise urgency `high` high, `low` low. Service is `service.summary`.
pub struct PagerDutyAdapter {
    signature: SignatureCheck,
}

impl PagerDutyAdapter {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            signature: SignatureCheck::new(SIGNATURE_HEADER, secret).with_scheme("v1="),
        }
    }
}

fn severity(data: &Value) -> Severity {
    let by_priority = str_at(data, &["priority", "summary"]).and_then(|p| {
        match p.to_ascii_uppercase().as_str() {
            "P1" => Some(Severity::Critical),
            "P2" => Some(Severity::High),
            "P3" => Some(Severity::Medium),
            "P4" | "P5" => Some(Severity::Low),
            _ => None,
        }
    });
    by_priority.unwrap_or_else(|| match str_at(data, &["urgency"]) {
        Some("high") => Severity::High,
        Some("low") => Severity::Low,
        _ => Severity::Medium,
    })
}

impl IncidentAdapter for PagerDutyAdapter {
    fn provider(&self) -> Provider {
        Provider::PagerDuty
    }

    fn validate(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), AdapterError> {
        self.signature.verify(headers, body)
    }

    fn parse(&self, body: &[u8]) -> Result<Incident, AdapterError> {
        let payload = Value::Object(parse_object(body)?);
        let event = payload.get("event").ok_or(AdapterError::MissingField("event"))?;

        let event_type = str_at(event, &["event_type"]).ok_or(AdapterError::MissingField("event.event_type"))?;
        if event_type != "incident.triggered" {
            return Err(AdapterError::IgnoredEvent(format!(
                "pagerduty event '{event_type}' does not open an incident"
            )));
        }

        let data = event.get("data").ok_or(AdapterError::MissingField("event.data"))?;
        let title = str_at(data, &["title"]).ok_or(AdapterError::MissingField("event.data.title"))?;
        let service = str_at(data, &["service", "summary"]).unwrap_or(UNKNOWN_SERVICE);
        let details = str_at(data, &["body", "details"]).or_else(|| str_at(data, &["description"]));

        let metadata = base_metadata(id_at(data, &["id"]), payload.clone());
        Ok(Incident::new(Provider::PagerDuty, service, title)
            .with_severity(severity(data))
            .with_stack_trace(details.and_then(extract_stack_trace))
            .with_metadata(metadata))
    }
}
