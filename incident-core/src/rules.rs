//! Operator-defined classification rules.
//!
//! A rule matches when every condition it declares holds. Matching rules are
//! applied in configured order with two different precedence regimes:
//! severity and metadata are last-match-wins, while repository override and
//! skip-remediation are first-match-wins.

use crate::error::RuleError;
use incident_model::{Incident, Severity};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    /// Regular expression searched for in the error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl RuleConditions {
    fn is_empty(&self) -> bool {
        self.service_name.is_none()
            && self.error_pattern.is_none()
            && self.severity.is_none()
            && self.provider.is_none()
            && self.metadata.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleActions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_severity: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub add_metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_repository: Option<String>,
    #[serde(default)]
    pub skip_remediation: bool,
}

impl RuleActions {
    fn is_empty(&self) -> bool {
        self.set_severity.is_none()
            && self.add_metadata.is_empty()
            && self.override_repository.is_none()
            && !self.skip_remediation
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CustomRule {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub conditions: RuleConditions,
    #[serde(default)]
    pub actions: RuleActions,
}

/// A rule that matched, carrying the actions it asks for.
#[derive(Clone, Debug, PartialEq)]
pub struct RuleMatch {
    pub rule_name: String,
    pub set_severity: Option<Severity>,
    pub add_metadata: BTreeMap<String, String>,
    pub override_repository: Option<String>,
    pub skip_remediation: bool,
}

#[derive(Clone, Debug)]
struct CompiledRule {
    rule: CustomRule,
    pattern: Option<Regex>,
    severity: Option<Severity>,
    set_severity: Option<Severity>,
}

impl CompiledRule {
    fn matches(&self, incident: &Incident) -> bool {
        let c = &self.rule.conditions;

        if c.service_name.as_deref().is_some_and(|s| s != incident.service_name) {
            return false;
        }
        if c.provider.as_deref().is_some_and(|p| p != incident.source.as_str()) {
            return false;
        }
        if self.severity.is_some_and(|s| s != incident.severity) {
            return false;
        }
        if self
            .pattern
            .as_ref()
            .is_some_and(|re| !re.is_match(&incident.error_message))
        {
            return false;
        }
        c.metadata
            .iter()
            .all(|(key, expected)| metadata_equals(incident.metadata.get(key), expected))
    }

    fn to_match(&self) -> RuleMatch {
        let a = &self.rule.actions;
        RuleMatch {
            rule_name: self.rule.name.clone(),
            set_severity: self.set_severity,
            add_metadata: a.add_metadata.clone(),
            override_repository: a.override_repository.clone(),
            skip_remediation: a.skip_remediation,
        }
    }
}

fn metadata_equals(actual: Option<&Value>, expected: &str) -> bool {
    match actual {
        Some(Value::String(s)) => s == expected,
        Some(other) => other.to_string() == expected,
        None => false,
    }
}

fn parse_severity(rule: &str, value: &str, place: &'static str) -> Result<Severity, RuleError> {
    value.parse().map_err(|_| RuleError::InvalidSeverity {
        rule: rule.to_string(),
        value: value.to_string(),
        place,
    })
}

fn compile(index: usize, rule: CustomRule) -> Result<CompiledRule, RuleError> {
    if rule.name.trim().is_empty() {
        return Err(RuleError::MissingName { index });
    }
    if rule.conditions.is_empty() {
        return Err(RuleError::NoConditions(rule.name));
    }
    if rule.actions.is_empty() {
        return Err(RuleError::NoActions(rule.name));
    }

    let pattern = rule
        .conditions
        .error_pattern
        .as_deref()
        .map(|p| {
            Regex::new(p).map_err(|e| RuleError::InvalidPattern {
                rule: rule.name.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()?;
    let severity = rule
        .conditions
        .severity
        .as_deref()
        .map(|s| parse_severity(&rule.name, s, "conditions"))
        .transpose()?;
    let set_severity = rule
        .actions
        .set_severity
        .as_deref()
        .map(|s| parse_severity(&rule.name, s, "actions"))
        .transpose()?;

    Ok(CompiledRule {
        rule,
        pattern,
        severity,
        set_severity,
    })
}

/// Checks a single rule the way [`RuleEngine::new`] does.
pub fn validate_rule(rule: &CustomRule) -> Result<(), RuleError> {
    compile(0, rule.clone()).map(|_| ())
}

#[derive(Clone, Debug, Default)]
pub struct RuleEngine {
    rules: Vec<CompiledRule>,
}

impl RuleEngine {
    /// Compiles every rule; the first invalid one aborts the whole set.
    pub fn new(rules: Vec<CustomRule>) -> Result<Self, RuleError> {
        let rules = rules
            .into_iter()
            .enumerate()
            .map(|(index, rule)| compile(index, rule))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn rules(&self) -> impl Iterator<Item = &CustomRule> {
        self.rules.iter().map(|r| &r.rule)
    }

    /// Enabled rules matching `incident`, in configured order.
    pub fn evaluate(&self, incident: &Incident) -> Vec<RuleMatch> {
        self.rules
            .iter()
            .filter(|r| r.rule.enabled && r.matches(incident))
            .map(CompiledRule::to_match)
            .collect()
    }
}

pub fn apply_actions(incident: &mut Incident, matches: &[RuleMatch]) {
    for m in matches {
        for (key, value) in &m.add_metadata {
            incident
                .metadata
                .insert(key.clone(), Value::String(value.clone()));
        }
        if let Some(severity) = m.set_severity {
            incident.severity = severity;
        }
    }
    if let Some(repository) = repository_override(matches) {
        incident.repository = repository.to_string();
    }
}

/// Repository from the first match that overrides it.
pub fn repository_override(matches: &[RuleMatch]) -> Option<&str> {
    matches
        .iter()
        .find_map(|m| m.override_repository.as_deref().filter(|r| !r.trim().is_empty()))
}

pub fn should_skip_remediation(matches: &[RuleMatch]) -> bool {
    matches.iter().any(|m| m.skip_remediation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use incident_model::Provider;

    fn incident() -> Incident {
        let mut incident = Incident::new(
            Provider::Datadog,
            "checkout",
            "java.lang.OutOfMemoryError: Java heap space",
        )
        .with_severity(Severity::Medium);
        incident
            .metadata
            .insert("env".into(), Value::String("prod".into()));
        incident
    }

    fn rule(name: &str, conditions: RuleConditions, actions: RuleActions) -> CustomRule {
        CustomRule {
            name: name.into(),
            enabled: true,
            conditions,
            actions,
        }
    }

    fn for_service(service: &str) -> RuleConditions {
        RuleConditions {
            service_name: Some(service.into()),
            ..RuleConditions::default()
        }
    }

    #[test]
    fn all_present_conditions_must_hold() {
        let engine = RuleEngine::new(vec![rule(
            "oom-prod",
            RuleConditions {
                service_name: Some("checkout".into()),
                error_pattern: Some("OutOfMemory".into()),
                severity: Some("medium".into()),
                provider: Some("datadog".into()),
                metadata: BTreeMap::from([("env".to_string(), "prod".to_string())]),
            },
            RuleActions {
                set_severity: Some("critical".into()),
                ..RuleActions::default()
            },
        )])
        .expect("valid");
        assert_eq!(engine.evaluate(&incident()).len(), 1);

        let mut staging = incident();
        staging
            .metadata
            .insert("env".into(), Value::String("staging".into()));
        assert!(engine.evaluate(&staging).is_empty());
    }

    #[test]
    fn matching_rule_applies_declared_actions() {
        let engine = RuleEngine::new(vec![rule(
            "route",
            for_service("checkout"),
            RuleActions {
                set_severity: Some("critical".into()),
                add_metadata: BTreeMap::from([("team".to_string(), "payments".to_string())]),
                override_repository: Some("acme/checkout-v2".into()),
                skip_remediation: true,
            },
        )])
        .expect("valid");

        let mut inc = incident();
        let matches = engine.evaluate(&inc);
        apply_actions(&mut inc, &matches);

        assert_eq!(inc.severity, Severity::Critical);
        assert_eq!(inc.metadata["team"], "payments");
        assert_eq!(inc.metadata["env"], "prod");
        assert_eq!(inc.repository, "acme/checkout-v2");
        assert!(should_skip_remediation(&matches));
    }

    #[test]
    fn non_matching_rule_leaves_incident_unchanged() {
        let engine = RuleEngine::new(vec![rule(
            "other-service",
            for_service("search"),
            RuleActions {
                set_severity: Some("low".into()),
                skip_remediation: true,
                ..RuleActions::default()
            },
        )])
        .expect("valid");

        let original = incident();
        let mut inc = original.clone();
        let matches = engine.evaluate(&inc);
        apply_actions(&mut inc, &matches);

        assert!(matches.is_empty());
        assert_eq!(inc, original);
        assert!(!should_skip_remediation(&matches));
    }

    #[test]
    fn severity_and_metadata_are_last_wins_repository_is_first_wins() {
        let engine = RuleEngine::new(vec![
            rule(
                "first",
                for_service("checkout"),
                RuleActions {
                    set_severity: Some("high".into()),
                    add_metadata: BTreeMap::from([("owner".to_string(), "alpha".to_string())]),
                    override_repository: Some("acme/first".into()),
                    ..RuleActions::default()
                },
            ),
            rule(
                "second",
                RuleConditions {
                    error_pattern: Some("heap".into()),
                    ..RuleConditions::default()
                },
                RuleActions {
                    set_severity: Some("low".into()),
                    add_metadata: BTreeMap::from([("owner".to_string(), "beta".to_string())]),
                    override_repository: Some("acme/second".into()),
                    ..RuleActions::default()
                },
            ),
        ])
        .expect("valid");

        let mut inc = incident();
        let matches = engine.evaluate(&inc);
        assert_eq!(matches.len(), 2);
        apply_actions(&mut inc, &matches);

        assert_eq!(inc.severity, Severity::Low);
        assert_eq!(inc.metadata["owner"], "beta");
        assert_eq!(inc.repository, "acme/first");
        assert_eq!(repository_override(&matches), Some("acme/first"));
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let mut disabled = rule(
            "off",
            for_service("checkout"),
            RuleActions {
                skip_remediation: true,
                ..RuleActions::default()
            },
        );
        disabled.enabled = false;
        let engine = RuleEngine::new(vec![disabled]).expect("valid");
        assert!(engine.evaluate(&incident()).is_empty());
    }

    #[test]
    fn validation_rejects_malformed_rules() {
        let actions = RuleActions {
            skip_remediation: true,
            ..RuleActions::default()
        };

        let unnamed = rule(" ", for_service("a"), actions.clone());
        assert_eq!(
            RuleEngine::new(vec![unnamed]).err(),
            Some(RuleError::MissingName { index: 0 })
        );

        let no_conditions = rule("empty", RuleConditions::default(), actions.clone());
        assert_eq!(
            validate_rule(&no_conditions),
            Err(RuleError::NoConditions("empty".into()))
        );

        let no_actions = rule("idle", for_service("a"), RuleActions::default());
        assert_eq!(validate_rule(&no_actions), Err(RuleError::NoActions("idle".into())));

        let bad_regex = rule(
            "regex",
            RuleConditions {
                error_pattern: Some("(unclosed".into()),
                ..RuleConditions::default()
            },
            actions.clone(),
        );
        assert!(matches!(
            validate_rule(&bad_regex),
            Err(RuleError::InvalidPattern { .. })
        ));

        let bad_condition_severity = rule(
            "sev",
            RuleConditions {
                severity: Some("urgent".into()),
                ..RuleConditions::default()
            },
            actions,
        );
        assert!(matches!(
            validate_rule(&bad_condition_severity),
            Err(RuleError::InvalidSeverity { place: "conditions", .. })
        ));

        let bad_action_severity = rule(
            "sev2",
            for_service("a"),
            RuleActions {
                set_severity: Some("p0".into()),
                ..RuleActions::default()
            },
        );
        assert!(matches!(
            validate_rule(&bad_action_severity),
            Err(RuleError::InvalidSeverity { place: "actions", .. })
        ));
    }

    #[test]
    fn rules_deserialize_from_yaml() {
        let yaml = r#"
- name: noisy-search
  conditions:
    service_name: search
    error_pattern: "timeout after \\d+ms"
  actions:
    set_severity: low
    skip_remediation: true
"#;
        let rules: Vec<CustomRule> = serde_yaml::from_str(yaml).expect("yaml");
        assert!(rules[0].enabled);
        let engine = RuleEngine::new(rules).expect("valid");

        let inc = Incident::new(Provider::Sentry, "search", "request timeout after 3000ms");
        let matches = engine.evaluate(&inc);
        assert_eq!(matches[0].rule_name, "noisy-search");
        assert!(should_skip_remediation(&matches));
    }
}
