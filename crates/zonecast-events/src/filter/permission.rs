//! Role and permission checks.
//!
//! Denies event types outside a principal's permission set, and for the
//! sensitive security types delivers non-administrators a payload with the
//! restricted operational fields stripped instead of denying outright.

use super::{EventFilter, FilterCounters, FilterDecision};
use crate::error::FilterError;
use serde_json::Value;
use zonecast_core::{Event, EventType, Principal};

/// Payload fields reserved for administrators on sensitive event types.
const RESTRICTED_FIELDS: &[&str] = &[
    "source_ip",
    "detection_signature",
    "raw_log",
    "rule_definition",
    "internal_notes",
    "analyst_notes",
];

/// Event types whose payloads carry restricted operational detail.
fn is_sensitive_type(event_type: EventType) -> bool {
    matches!(
        event_type,
        EventType::SecurityAlert | EventType::ThreatDetected | EventType::PolicyUpdated
    )
}

/// The permission stage of the filter chain.
#[derive(Debug, Default)]
pub struct PermissionFilter {
    counters: FilterCounters,
}

impl PermissionFilter {
    /// Create a permission filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn check(&self, event: &Event, principal: &Principal) -> FilterDecision {
        if event.event_type.is_admin_only() && !principal.admin {
            return FilterDecision::deny(format!(
                "event type {} requires administrator access",
                event.event_type
            ));
        }
        if !principal.permissions().allows(event.event_type) {
            return FilterDecision::deny(format!(
                "event type {} is not permitted",
                event.event_type
            ));
        }

        if !principal.admin && is_sensitive_type(event.event_type) {
            let stripped = strip_restricted_fields(&event.data);
            if stripped != event.data {
                return FilterDecision::modify(stripped, "restricted fields removed");
            }
        }

        FilterDecision::Allow
    }
}

/// Remove [`RESTRICTED_FIELDS`] from every object in the payload.
fn strip_restricted_fields(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let stripped = map
                .iter()
                .filter(|(key, _)| !RESTRICTED_FIELDS.contains(&key.as_str()))
                .map(|(key, nested)| (key.clone(), strip_restricted_fields(nested)))
                .collect();
            Value::Object(stripped)
        },
        Value::Array(items) => Value::Array(items.iter().map(strip_restricted_fields).collect()),
        other => other.clone(),
    }
}

#[async_trait::async_trait]
impl EventFilter for PermissionFilter {
    fn name(&self) -> &'static str {
        "permission"
    }

    fn priority(&self) -> u32 {
        10
    }

    async fn apply(
        &self,
        event: &Event,
        principal: &Principal,
    ) -> Result<FilterDecision, FilterError> {
        Ok(self.check(event, principal))
    }

    fn counters(&self) -> &FilterCounters {
        &self.counters
    }
}
