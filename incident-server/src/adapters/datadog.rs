use super::{
    base_metadata, extract_stack_trace, id_at, parse_object, str_at, AdapterError,
    IncidentAdapter, SignatureCheck,
};
use axum::http::HeaderMap;
use incident_model::{Incident, Provider, Severity, UNKNOWN_SERVICE};
use serde_json::Value;

pub const SIGNATURE_HEADER: &str = "x-datadog-signature";

/// Datadog monitor webhooks.
///
/// Severity: priority `P1` critical, `P2` high, `P3` medium, `P4`/`P5` low.
/// Without a priority, `alert_type` decides: `error` high, `warning` medium,
/// `info` low. Service comes from the `service:<name>` tag.
pub struct DatadogAdapter {
    signature: SignatureCheck,
}

impl DatadogAdapter {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            signature: SignatureCheck::new(SIGNATURE_HEADER, secret),
        }
    }
}

fn severity(payload: &Value) -> Severity {
    let by_priority = str_at(payload, &["priority"]).and_then(|p| match p.to_ascii_uppercase().as_str() {
        "P1" => Some(Severity::Critical),
        "P2" => Some(Severity::High),
        "P3" => Some(Severity::Medium),
        "P4" | "P5" => Some(Severity::Low),
        _ => None,
    });
    by_priority.unwrap_or_else(|| match str_at(payload, &["alert_type"]).unwrap_or_default() {
        "error" => Severity::High,
        "info" => Severity::Low,
        _ => Severity::Medium,
    })
}

/// Tags arrive either as a comma-separated string or as an array.
fn tags(payload: &Value) -> Vec<String> {
    match payload.get("tags") {
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(ToString::to_string)
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|t| t.trim().to_string())
            .collect(),
        _ => Vec::new(),
    }
}

impl IncidentAdapter for DatadogAdapter {
    fn provider(&self) -> Provider {
        Provider::Datadog
    }

    fn validate(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), AdapterError> {
        self.signature.verify(headers, body)
    }

    fn parse(&self, body: &[u8]) -> Result<Incident, AdapterError> {
        let payload = Value::Object(parse_object(body)?);

        let transition = str_at(&payload, &["transition"]).unwrap_or("Triggered");
        if transition.eq_ignore_ascii_case("recovered")
            || str_at(&payload, &["alert_type"]) == Some("success")
        {
            return Err(AdapterError::IgnoredEvent(format!(
                "datadog transition '{transition}' is not a triggered alert"
            )));
        }

        let title = str_at(&payload, &["title"])
            .or_else(|| str_at(&payload, &["alert_title"]))
            .ok_or(AdapterError::MissingField("title"))?;
        let text = str_at(&payload, &["body"]).or_else(|| str_at(&payload, &["text"]));

        let tags = tags(&payload);
        let service = tags
            .iter()
            .find_map(|t| t.strip_prefix("service:"))
            .unwrap_or(UNKNOWN_SERVICE)
            .to_string();
        let external_id = id_at(&payload, &["id"]).or_else(|| id_at(&payload, &["alert_id"]));

        let mut metadata = base_metadata(external_id, payload.clone());
        metadata.insert(
            "tags".into(),
            Value::Array(tags.iter().cloned().map(Value::String).collect()),
        );

        Ok(Incident::new(Provider::Datadog, &service, title)
            .with_severity(severity(&payload))
            .with_stack_trace(text.and_then(extract_stack_trace))
            .with_metadata(metadata))
    }
}
