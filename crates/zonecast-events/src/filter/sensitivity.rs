//! Payload redaction for non-administrators.
//!
//! Runs last in the chain (priority 20), after permission checks have
//! already denied what must not be seen at all. For everyone below the
//! administrator role the payload is walked recursively:
//!
//! - values under secret-bearing keys (`secret`, `token`, `password`,
//!   `credential`, `*_key`) are replaced wholesale with `[REDACTED]`
//! - values under low-sensitivity operational keys (`internal_ip`,
//!   `session_id`, `hostname`) are replaced with `[REDACTED]`
//! - every remaining string is scanned for embedded emails, SSNs, card
//!   numbers, and IPv4 addresses, which are replaced with `[EMAIL]`,
//!   `[SSN]`, `[CARD]`, and `[IP]`
//!
//! Redaction is idempotent: the placeholders never match the scans, so
//! filtering an already filtered payload changes nothing.

use super::{EventFilter, FilterCounters, FilterDecision};
use crate::error::FilterError;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use zonecast_core::{Event, Principal};

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("invalid regex")
});
static SSN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("invalid regex"));
static CARD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{4}[ -]?\d{4}[ -]?\d{4}[ -]?\d{4}\b").expect("invalid regex")
});
static IPV4_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("invalid regex"));

/// Replacement for values redacted by key.
const REDACTED: &str = "[REDACTED]";

/// Operational fields hidden from non-administrators.
const OPERATIONAL_FIELDS: &[&str] = &["internal_ip", "session_id", "hostname"];

fn key_is_secret(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    const MARKERS: &[&str] = &["secret", "token", "password", "credential"];
    if MARKERS.iter().any(|m| key.contains(m)) {
        return true;
    }
    key == "key" || key.ends_with("_key") || key.starts_with("key_")
}

fn key_is_operational(key: &str) -> bool {
    OPERATIONAL_FIELDS.contains(&key.to_ascii_lowercase().as_str())
}

fn scrub_string(s: &str) -> String {
    let scrubbed = EMAIL_RE.replace_all(s, "[EMAIL]");
    let scrubbed = SSN_RE.replace_all(&scrubbed, "[SSN]");
    let scrubbed = CARD_RE.replace_all(&scrubbed, "[CARD]");
    let scrubbed = IPV4_RE.replace_all(&scrubbed, "[IP]");
    scrubbed.into_owned()
}

/// Recursively redact a payload.
fn redact_payload(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let redacted = map
                .iter()
                .map(|(key, nested)| {
                    if key_is_secret(key) || key_is_operational(key) {
                        (key.clone(), Value::String(REDACTED.to_string()))
                    } else {
                        (key.clone(), redact_payload(nested))
                    }
                })
                .collect();
            Value::Object(redacted)
        },
        Value::Array(items) => Value::Array(items.iter().map(redact_payload).collect()),
        Value::String(s) => Value::String(scrub_string(s)),
        other => other.clone(),
    }
}

/// The data-sensitivity stage of the filter chain.
#[derive(Debug, Default)]
pub struct SensitivityFilter {
    counters: FilterCounters,
}

impl SensitivityFilter {
    /// Create a sensitivity filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl EventFilter for SensitivityFilter {
    fn name(&self) -> &'static str {
        "sensitivity"
    }

    fn priority(&self) -> u32 {
        20
    }

    async fn apply(
        &self,
        event: &Event,
        principal: &Principal,
    ) -> Result<FilterDecision, FilterError> {
        if principal.admin {
            return Ok(FilterDecision::Allow);
        }
        let redacted = redact_payload(&event.data);
        if redacted == event.data {
            Ok(FilterDecision::Allow)
        } else {
            Ok(FilterDecision::modify(redacted, "sensitive data redacted"))
        }
    }

    fn counters(&self) -> &FilterCounters {
        &self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use zonecast_core::EventType;

    async fn filtered(data: Value) -> Value {
        let filter = SensitivityFilter::new();
        let op = Principal::new("op");
        let event = Event::new(EventType::SystemNotice, data);
        match filter.apply(&event, &op).await.unwrap() {
            FilterDecision::Allow => event.data,
            FilterDecision::Modify { payload, .. } => payload,
            FilterDecision::Deny { .. } => panic!("sensitivity filter never denies"),
        }
    }

    #[tokio::test]
    async fn embedded_emails_become_placeholders() {
        let out = filtered(json!({"note": "contact admin@example.com for access"})).await;
        assert_eq!(out["note"], "contact [EMAIL] for access");
    }

    #[tokio::test]
    async fn secret_keys_are_fully_redacted() {
        let out = filtered(json!({
            "api_token": "abcd1234",
            "signing_key": {"alg": "ed25519", "value": "..."},
            "zone": "example.com"
        }))
        .await;
        assert_eq!(out["api_token"], REDACTED);
        assert_eq!(out["signing_key"], REDACTED);
        assert_eq!(out["zone"], "example.com");
    }

    #[tokio::test]
    async fn operational_fields_are_redacted() {
        let out = filtered(json!({"internal_ip": "10.1.2.3", "hostname": "ns1.internal"})).await;
        assert_eq!(out["internal_ip"], REDACTED);
        assert_eq!(out["hostname"], REDACTED);
    }

    #[tokio::test]
    async fn embedded_identifiers_are_scrubbed() {
        let out = filtered(json!({
            "detail": "ssn 123-45-6789 card 4111 1111 1111 1111 from 192.168.1.10"
        }))
        .await;
        assert_eq!(out["detail"], "ssn [SSN] card [CARD] from [IP]");
    }

    #[tokio::test]
    async fn arrays_are_walked() {
        let out = filtered(json!({"recipients": ["a@example.com", "b@example.com"]})).await;
        assert_eq!(out["recipients"][0], "[EMAIL]");
        assert_eq!(out["recipients"][1], "[EMAIL]");
    }

    #[tokio::test]
    async fn admins_see_everything() {
        let filter = SensitivityFilter::new();
        let root = Principal::new("root").with_admin();
        let event = Event::new(
            EventType::SystemNotice,
            json!({"api_token": "abcd", "email": "admin@example.com"}),
        );
        let decision = filter.apply(&event, &root).await.unwrap();
        assert_eq!(decision, FilterDecision::Allow);
    }

    #[tokio::test]
    async fn clean_payloads_are_allowed_unchanged() {
        let filter = SensitivityFilter::new();
        let op = Principal::new("op");
        let event = Event::new(EventType::SystemNotice, json!({"zone": "example.com"}));
        let decision = filter.apply(&event, &op).await.unwrap();
        assert_eq!(decision, FilterDecision::Allow);
    }

    #[test]
    fn redaction_is_idempotent() {
        let payload = json!({
            "note": "mail ops@example.com at 10.0.0.1",
            "api_token": "abcd",
            "nested": {"ssn": "123-45-6789"}
        });
        let once = redact_payload(&payload);
        let twice = redact_payload(&once);
        assert_eq!(once, twice);
    }
}
