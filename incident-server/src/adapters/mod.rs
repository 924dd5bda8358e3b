//! Provider webhook adapters.
//!
//! Each adapter authenticates a raw request body against its provider's
//! signature header and turns the provider payload into a canonical
//! [`Incident`]. Adapters are looked up by provider name at request time.

mod datadog;
mod grafana;
mod pagerduty;
mod sentry;
mod signature;

pub use datadog::DatadogAdapter;
pub use grafana::GrafanaAdapter;
pub use pagerduty::PagerDutyAdapter;
pub use sentry::SentryAdapter;
pub use signature::{sign_hex, SignatureCheck};

use axum::http::HeaderMap;
use incident_model::{Incident, Provider};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("missing signature header {0}")]
    MissingSignature(&'static str),
    #[error("signature mismatch")]
    InvalidSignature,
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("payload is missing required field '{0}'")]
    MissingField(&'static str),
    #[error("event ignored: {0}")]
    IgnoredEvent(String),
    #[error("unsupported provider '{0}'")]
    UnsupportedProvider(String),
}

impl AdapterError {
    /// Short label for the `incidents_rejected_total` metric.
    pub fn reason(&self) -> &'static str {
        match self {
            AdapterError::MissingSignature(_) | AdapterError::InvalidSignature => "signature",
            AdapterError::InvalidJson(_) => "invalid_json",
            AdapterError::MissingField(_) => "missing_field",
            AdapterError::IgnoredEvent(_) => "ignored_event",
            AdapterError::UnsupportedProvider(_) => "unsupported_provider",
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            AdapterError::MissingSignature(_) | AdapterError::InvalidSignature
        )
    }
}

pub trait IncidentAdapter: Send + Sync + 'static {
    fn provider(&self) -> Provider;

    fn provider_name(&self) -> &'static str {
        self.provider().as_str()
    }

    /// Checks the request signature. A no-op when no secret is configured.
    fn validate(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), AdapterError>;

    fn parse(&self, body: &[u8]) -> Result<Incident, AdapterError>;
}

/// Shared secrets per provider, taken from the environment at start-up.
#[derive(Clone, Debug, Default)]
pub struct ProviderSecrets {
    pub datadog: Option<String>,
    pub pagerduty: Option<String>,
    pub grafana: Option<String>,
    pub sentry: Option<String>,
}

#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<&'static str, Arc<dyn IncidentAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in provider.
    pub fn with_builtin(secrets: &ProviderSecrets) -> Self {
        let mut registry = Self::new();
        registry.register(DatadogAdapter::new(secrets.datadog.clone()));
        registry.register(PagerDutyAdapter::new(secrets.pagerduty.clone()));
        registry.register(GrafanaAdapter::new(secrets.grafana.clone()));
        registry.register(SentryAdapter::new(secrets.sentry.clone()));
        registry
    }

    pub fn register(&mut self, adapter: impl IncidentAdapter) {
        self.adapters.insert(adapter.provider_name(), Arc::new(adapter));
    }

    pub fn get(&self, provider: &str) -> Result<Arc<dyn IncidentAdapter>, AdapterError> {
        self.adapters
            .get(provider.trim().to_ascii_lowercase().as_str())
            .cloned()
            .ok_or_else(|| AdapterError::UnsupportedProvider(provider.to_string()))
    }

    pub fn providers(&self) -> Vec<&'static str> {
        self.adapters.keys().copied().collect()
    }
}

pub(crate) fn parse_object(body: &[u8]) -> Result<Map<String, Value>, AdapterError> {
    match serde_json::from_slice::<Value>(body)? {
        Value::Object(map) => Ok(map),
        _ => Err(AdapterError::MissingField("body")),
    }
}

/// Non-empty string at `path`, walking nested objects.
pub(crate) fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    current.as_str().map(str::trim).filter(|s| !s.is_empty())
}

/// String or number at `path`, as text. Provider IDs come in both shapes.
pub(crate) fn id_at(value: &Value, path: &[&str]) -> Option<String> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    match current {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Metadata every adapter records: the provider's own alert ID and the
/// payload as received.
pub(crate) fn base_metadata(external_id: Option<String>, payload: Value) -> Map<String, Value> {
    let mut metadata = Map::new();
    if let Some(id) = external_id {
        metadata.insert("external_id".into(), Value::String(id));
    }
    metadata.insert("provider_payload".into(), payload);
    metadata
}

static FRAME_LINE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r#"^\s+at\s+\S|^\s*File "[^"]+", line \d+|^\s*#\d+\s+\S|^\s*\S+\.(?:go|rs|py|js|ts|rb|java|kt):\d+|^goroutine \d+ \["#,
    )
    .ok()
});

/// Best-effort stack trace from free text. Returns the block running from
/// the line above the first frame (usually the exception line) to the last
/// frame, or `None` when no frame-shaped lines exist.
pub fn extract_stack_trace(text: &str) -> Option<String> {
    if let Some(start) = text.find("Traceback (most recent call last)") {
        return Some(text[start..].trim_end().to_string());
    }

    let frame = FRAME_LINE.as_ref()?;
    let lines: Vec<&str> = text.lines().collect();
    let first = lines.iter().position(|l| frame.is_match(l))?;
    let last = lines.iter().rposition(|l| frame.is_match(l))?;
    let start = if first > 0 && !lines[first - 1].trim().is_empty() {
        first - 1
    } else {
        first
    };
    Some(lines[start..=last].join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_every_builtin_provider() {
        let registry = AdapterRegistry::with_builtin(&ProviderSecrets::default());
        assert_eq!(
            registry.providers(),
            vec!["datadog", "grafana", "pagerduty", "sentry"]
        );
        for provider in Provider::ALL {
            let adapter = registry.get(provider.as_str()).expect("registered");
            assert_eq!(adapter.provider(), provider);
        }
        assert_eq!(registry.get("PagerDuty").expect("case").provider(), Provider::PagerDuty);
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let registry = AdapterRegistry::with_builtin(&ProviderSecrets::default());
        let err = registry.get("newrelic").err().expect("unsupported");
        assert!(matches!(err, AdapterError::UnsupportedProvider(p) if p == "newrelic"));
    }

    #[test]
    fn java_trace_is_extracted_with_exception_line() {
        let text = "Checkout failed\njava.lang.NullPointerException: cart\n    at com.acme.Cart.total(Cart.java:42)\n    at com.acme.Api.handle(Api.java:7)\nsee runbook";
        let trace = extract_stack_trace(text).expect("trace");
        assert!(trace.starts_with("java.lang.NullPointerException"));
        assert!(trace.ends_with("(Api.java:7)"));
    }

    #[test]
    fn python_traceback_runs_to_end_of_text() {
        let text = "alert\nTraceback (most recent call last):\n  File \"app.py\", line 3, in <module>\nKeyError: 'id'";
        let trace = extract_stack_trace(text).expect("trace");
        assert!(trace.starts_with("Traceback"));
        assert!(trace.ends_with("KeyError: 'id'"));
    }

    #[test]
    fn plain_text_has_no_trace() {
        assert_eq!(extract_stack_trace("CPU above 90% for 5 minutes"), None);
    }

    #[test]
    fn lookup_helpers_skip_blank_values() {
        let value = serde_json::json!({ "a": { "b": "  " , "n": 42, "s": "x" } });
        assert_eq!(str_at(&value, &["a", "b"]), None);
        assert_eq!(str_at(&value, &["a", "s"]), Some("x"));
        assert_eq!(id_at(&value, &["a", "n"]).as_deref(), Some("42"));
    }
}
