use super::{
    base_metadata, extract_stack_trace, id_at, parse_object, str_at, AdapterError,
    IncidentAdapter, SignatureCheck,
};
use axum::http::HeaderMap;
use incident_model::{Incident, Provider, Severity, UNKNOWN_SERVICE};
use serde_json::Value;

pub const SIGNATURE_HEADER: &str = "sentry-hook-signature";

/// Sentry issue and event-alert webhooks; only `created` actions count.
///
/// Severity from `level`: `fatal` critical, `error` high, `warning` medium,
/// `info`/`debug` low. Service is the project slug.
pub struct SentryAdapter {
    signature: SignatureCheck,
}

impl SentryAdapter {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            signature: SignatureCheck::new(SIGNATURE_HEADER, secret),
        }
    }
}

fn severity(level: Option<&str>) -> Severity {
    match level.unwrap_or_default() {
        "fatal" => Severity::Critical,
        "error" => Severity::High,
        "info" | "debug" => Severity::Low,
        _ => Severity::Medium,
    }
}

/// Renders the innermost exception's frames, most recent call last.
fn exception_trace(event: &Value) -> Option<String> {
    let exception = event
        .get("exception")
        .and_then(|e| e.get("values"))
        .and_then(Value::as_array)
        .and_then(|values| values.last())?;
    let frames = exception
        .get("stacktrace")
        .and_then(|s| s.get("frames"))
        .and_then(Value::as_array)?;

    let mut lines = Vec::with_capacity(frames.len() + 1);
    let kind = str_at(exception, &["type"]).unwrap_or("Exception");
    match str_at(exception, &["value"]) {
        Some(value) => lines.push(format!("{kind}: {value}")),
        None => lines.push(kind.to_string()),
    }
    for frame in frames {
        let file = str_at(frame, &["filename"])
            .or_else(|| str_at(frame, &["abs_path"]))
            .unwrap_or("?");
        let function = str_at(frame, &["function"]).unwrap_or("?");
        let line = frame.get("lineno").and_then(Value::as_u64);
        lines.push(match line {
            Some(n) => format!("  at {function} ({file}:{n})"),
            None => format!("  at {function} ({file})"),
        });
    }
    (lines.len() > 1).then(|| lines.join("\n"))
}

impl IncidentAdapter for SentryAdapter {
    fn provider(&self) -> Provider {
        Provider::Sentry
    }

    fn validate(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), AdapterError> {
        self.signature.verify(headers, body)
    }

    fn parse(&self, body: &[u8]) -> Result<Incident, AdapterError> {
        let payload = Value::Object(parse_object(body)?);

        let action = str_at(&payload, &["action"]).ok_or(AdapterError::MissingField("action"))?;
        if action != "created" && action != "triggered" {
            return Err(AdapterError::IgnoredEvent(format!("sentry action '{action}'")));
        }
        let data = payload.get("data").ok_or(AdapterError::MissingField("data"))?;

        // Issue webhooks only announce new issues; alert rules fire `triggered`
        // with the event alone.
        let (subject, event) = match (action, data.get("issue"), data.get("event")) {
            ("created", Some(issue), event) => (issue, event),
            ("triggered", None, Some(event)) => (event, Some(event)),
            (_, None, None) => return Err(AdapterError::MissingField("data.issue")),
            (action, _, _) => {
                return Err(AdapterError::IgnoredEvent(format!(
                    "sentry action '{action}' does not match the payload shape"
                )))
            }
        };

        let title = str_at(subject, &["title"])
            .or_else(|| str_at(subject, &["culprit"]))
            .ok_or(AdapterError::MissingField("data.issue.title"))?;
        let service = str_at(subject, &["project", "slug"])
            .or_else(|| str_at(subject, &["project_slug"]))
            .or_else(|| event.and_then(|e| str_at(e, &["project_slug"])))
            .unwrap_or(UNKNOWN_SERVICE);
        let level = str_at(subject, &["level"]).or_else(|| event.and_then(|e| str_at(e, &["level"])));

        let stack_trace = event
            .and_then(exception_trace)
            .or_else(|| str_at(subject, &["metadata", "value"]).and_then(extract_stack_trace));

        let metadata = base_metadata(id_at(subject, &["id"]).or_else(|| id_at(subject, &["event_id"])), payload.clone());
        Ok(Incident::new(Provider::Sentry, service, title)
            .with_severity(severity(level))
            .with_stack_trace(stack_trace)
            .with_metadata(metadata))
    }
}
