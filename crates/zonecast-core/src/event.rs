//! The Zonecast event model.
//!
//! Control-plane services describe state changes as [`Event`] values: a
//! closed [`EventType`] taxonomy grouped into [`EventCategory`] buckets, a
//! JSON payload, an optional source principal, and an ordered
//! [`EventPriority`]. Events are immutable once created; the routing layer
//! produces per-principal [`OutboundEventMessage`] frames from them.
//!
//! The taxonomy is closed on purpose: a string that does not name a known
//! type is a [`CoreError::UnknownEventType`], never a silent passthrough.

use crate::error::CoreError;
use crate::identity::PrincipalId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Create a new random event ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an event ID from a UUID.
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event:{}", self.0)
    }
}

/// Every event type the control plane can emit.
///
/// Each type belongs to exactly one [`EventCategory`]. The wire form is the
/// snake_case name (`record_updated`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Health
    /// A monitored endpoint changed health state
    HealthUpdate,
    /// A scheduled health probe failed
    HealthCheckFailed,
    /// Resolution latency crossed a configured threshold
    LatencyAlert,

    // DNS
    /// A zone was created
    ZoneCreated,
    /// A zone's settings changed
    ZoneUpdated,
    /// A zone was deleted
    ZoneDeleted,
    /// A record was added to a zone
    RecordCreated,
    /// A record's data changed
    RecordUpdated,
    /// A record was removed from a zone
    RecordDeleted,
    /// DNSSEC signing state changed for a zone
    DnssecStatusChanged,

    // Security
    /// A security rule fired
    SecurityAlert,
    /// Anomalous query or mutation activity was detected
    ThreatDetected,
    /// A security policy was changed
    PolicyUpdated,
    /// A certificate approaches its expiry
    CertificateExpiring,

    // User (admin-only category)
    /// A user account was created
    UserCreated,
    /// A user account was modified
    UserUpdated,
    /// A user account was deactivated
    UserDeactivated,
    /// A user session began
    SessionStarted,
    /// A user session ended
    SessionEnded,

    // Connection
    /// A client connected to the distribution layer
    ClientConnected,
    /// A client disconnected
    ClientDisconnected,
    /// A client connection degraded into recovery
    ConnectionDegraded,

    // System
    /// General operator notice
    SystemNotice,
    /// Maintenance window announcement
    MaintenanceScheduled,
    /// Server configuration was reloaded
    ConfigReloaded,
    /// Message broadcast by an administrator
    AdminBroadcast,
}

impl EventType {
    /// All event types, in taxonomy order.
    pub const ALL: &'static [EventType] = &[
        Self::HealthUpdate,
        Self::HealthCheckFailed,
        Self::LatencyAlert,
        Self::ZoneCreated,
        Self::ZoneUpdated,
        Self::ZoneDeleted,
        Self::RecordCreated,
        Self::RecordUpdated,
        Self::RecordDeleted,
        Self::DnssecStatusChanged,
        Self::SecurityAlert,
        Self::ThreatDetected,
        Self::PolicyUpdated,
        Self::CertificateExpiring,
        Self::UserCreated,
        Self::UserUpdated,
        Self::UserDeactivated,
        Self::SessionStarted,
        Self::SessionEnded,
        Self::ClientConnected,
        Self::ClientDisconnected,
        Self::ConnectionDegraded,
        Self::SystemNotice,
        Self::MaintenanceScheduled,
        Self::ConfigReloaded,
        Self::AdminBroadcast,
    ];

    /// The category this type belongs to.
    #[must_use]
    pub fn category(self) -> EventCategory {
        match self {
            Self::HealthUpdate | Self::HealthCheckFailed | Self::LatencyAlert => {
                EventCategory::Health
            },
            Self::ZoneCreated
            | Self::ZoneUpdated
            | Self::ZoneDeleted
            | Self::RecordCreated
            | Self::RecordUpdated
            | Self::RecordDeleted
            | Self::DnssecStatusChanged => EventCategory::Dns,
            Self::SecurityAlert
            | Self::ThreatDetected
            | Self::PolicyUpdated
            | Self::CertificateExpiring => EventCategory::Security,
            Self::UserCreated
            | Self::UserUpdated
            | Self::UserDeactivated
            | Self::SessionStarted
            | Self::SessionEnded => EventCategory::User,
            Self::ClientConnected | Self::ClientDisconnected | Self::ConnectionDegraded => {
                EventCategory::Connection
            },
            Self::SystemNotice
            | Self::MaintenanceScheduled
            | Self::ConfigReloaded
            | Self::AdminBroadcast => EventCategory::System,
        }
    }

    /// Whether only administrators may see or subscribe to this type.
    #[must_use]
    pub fn is_admin_only(self) -> bool {
        self.category().is_admin_only()
    }

    /// The canonical snake_case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HealthUpdate => "health_update",
            Self::HealthCheckFailed => "health_check_failed",
            Self::LatencyAlert => "latency_alert",
            Self::ZoneCreated => "zone_created",
            Self::ZoneUpdated => "zone_updated",
            Self::ZoneDeleted => "zone_deleted",
            Self::RecordCreated => "record_created",
            Self::RecordUpdated => "record_updated",
            Self::RecordDeleted => "record_deleted",
            Self::DnssecStatusChanged => "dnssec_status_changed",
            Self::SecurityAlert => "security_alert",
            Self::ThreatDetected => "threat_detected",
            Self::PolicyUpdated => "policy_updated",
            Self::CertificateExpiring => "certificate_expiring",
            Self::UserCreated => "user_created",
            Self::UserUpdated => "user_updated",
            Self::UserDeactivated => "user_deactivated",
            Self::SessionStarted => "session_started",
            Self::SessionEnded => "session_ended",
            Self::ClientConnected => "client_connected",
            Self::ClientDisconnected => "client_disconnected",
            Self::ConnectionDegraded => "connection_degraded",
            Self::SystemNotice => "system_notice",
            Self::MaintenanceScheduled => "maintenance_scheduled",
            Self::ConfigReloaded => "config_reloaded",
            Self::AdminBroadcast => "admin_broadcast",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|ty| ty.as_str() == s)
            .ok_or_else(|| CoreError::UnknownEventType(s.to_string()))
    }
}

/// Groups of related event types.
///
/// Categories form a fixed taxonomy: subscribing to a category subscribes
/// to its member types. The `user` category carries identity and session
/// lifecycle events and is visible to administrators only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Endpoint health and latency
    Health,
    /// Zone and record mutations
    Dns,
    /// Alerts, threats, and policy
    Security,
    /// Identity and session lifecycle (admin-only)
    User,
    /// Distribution-layer connection lifecycle
    Connection,
    /// Operator notices and server lifecycle
    System,
}

impl EventCategory {
    /// All categories, in taxonomy order.
    pub const ALL: &'static [EventCategory] = &[
        Self::Health,
        Self::Dns,
        Self::Security,
        Self::User,
        Self::Connection,
        Self::System,
    ];

    /// The event types belonging to this category.
    #[must_use]
    pub fn member_types(self) -> Vec<EventType> {
        EventType::ALL
            .iter()
            .copied()
            .filter(|ty| ty.category() == self)
            .collect()
    }

    /// Whether only administrators may subscribe to this category.
    #[must_use]
    pub fn is_admin_only(self) -> bool {
        matches!(self, Self::User)
    }

    /// The canonical snake_case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Health => "health",
            Self::Dns => "dns",
            Self::Security => "security",
            Self::User => "user",
            Self::Connection => "connection",
            Self::System => "system",
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventCategory {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|cat| cat.as_str() == s)
            .ok_or_else(|| CoreError::UnknownEventCategory(s.to_string()))
    }
}

/// Delivery priority of an event.
///
/// Priorities are totally ordered; the router may defer `Low` events under
/// load but never reorders within a single connection's queue.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    /// Deferrable background information
    Low,
    /// Regular state change
    #[default]
    Normal,
    /// Should be delivered promptly
    High,
    /// Must never be deferred
    Critical,
}

impl EventPriority {
    /// The canonical snake_case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for EventPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventPriority {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(CoreError::UnknownEventPriority(other.to_string())),
        }
    }
}

/// A single control-plane state change.
///
/// Events are created by domain services and consumed by the router; they
/// are never mutated after creation. The payload is an arbitrary JSON
/// object; the filter chain may produce redacted copies per principal, but
/// the original event is shared immutably.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier
    pub id: EventId,
    /// What happened
    pub event_type: EventType,
    /// JSON payload describing the change
    pub data: serde_json::Value,
    /// The principal whose action produced this event, if any
    pub source: Option<PrincipalId>,
    /// Delivery priority
    pub priority: EventPriority,
    /// When the event was created
    pub timestamp: DateTime<Utc>,
    /// Free-form routing metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Event {
    /// Create a new event with `Normal` priority and a fresh ID.
    #[must_use]
    pub fn new(event_type: EventType, data: serde_json::Value) -> Self {
        Self {
            id: EventId::new(),
            event_type,
            data,
            source: None,
            priority: EventPriority::Normal,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Attribute the event to a source principal.
    #[must_use]
    pub fn with_source(mut self, source: PrincipalId) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the delivery priority.
    #[must_use]
    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The category of this event's type.
    #[must_use]
    pub fn category(&self) -> EventCategory {
        self.event_type.category()
    }
}

/// The wire frame delivered to a connected client.
///
/// Serialized as one JSON text frame per event. `data` carries the
/// per-principal payload produced by the filter chain, which may differ
/// from the original event's payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEventMessage {
    /// Event identifier
    pub id: EventId,
    /// Event type, as snake_case
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Per-principal payload
    pub data: serde_json::Value,
    /// Event creation time
    pub timestamp: DateTime<Utc>,
    /// Delivery priority
    pub priority: EventPriority,
    /// Routing metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl OutboundEventMessage {
    /// Build the outbound frame for one principal from an event and that
    /// principal's filtered payload.
    #[must_use]
    pub fn from_event(event: &Event, data: serde_json::Value) -> Self {
        Self {
            id: event.id,
            event_type: event.event_type,
            data,
            timestamp: event.timestamp,
            priority: event.priority,
            metadata: event.metadata.clone(),
        }
    }
}
