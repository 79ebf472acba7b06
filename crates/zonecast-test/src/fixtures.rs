//! Test fixtures for common types.

use chrono::Utc;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use std::time::Duration;
use zonecast_core::{Event, EventPriority, EventType, Principal};
use zonecast_gateway::{encode_token, encode_unsigned_token, ConnectionSettings, TokenClaims};

/// Create an operator principal.
#[must_use]
pub fn operator(username: &str) -> Principal {
    Principal::new(username)
}

/// Create an administrator principal.
#[must_use]
pub fn admin(username: &str) -> Principal {
    Principal::new(username).with_admin()
}

/// A DNS record change event.
#[must_use]
pub fn record_event(zone: &str) -> Event {
    Event::new(
        EventType::RecordUpdated,
        serde_json::json!({ "zone": zone, "record": "www", "rtype": "A" }),
    )
}

/// A security alert event at high priority.
#[must_use]
pub fn security_event() -> Event {
    Event::new(
        EventType::SecurityAlert,
        serde_json::json!({ "alert": "spoofed response detected" }),
    )
    .with_priority(EventPriority::High)
}

/// A low-priority health update, eligible for load shedding.
#[must_use]
pub fn health_event() -> Event {
    Event::new(
        EventType::HealthUpdate,
        serde_json::json!({ "resolver": "ns1", "status": "ok" }),
    )
    .with_priority(EventPriority::Low)
}

/// An event of an arbitrary type with an empty object payload.
#[must_use]
pub fn event_of(event_type: EventType) -> Event {
    Event::new(event_type, serde_json::json!({}))
}

/// Generate an Ed25519 signing key for token tests.
#[must_use]
pub fn signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// A signed token for `username`, valid for one hour.
#[must_use]
pub fn signed_token(username: &str, is_admin: bool, key: &SigningKey) -> String {
    let claims = TokenClaims::new(username, is_admin, chrono::Duration::hours(1));
    encode_token(&claims, key).unwrap_or_default()
}

/// An unsigned token for `username`, valid for one hour.
#[must_use]
pub fn unsigned_token(username: &str, is_admin: bool) -> String {
    let claims = TokenClaims::new(username, is_admin, chrono::Duration::hours(1));
    encode_unsigned_token(&claims).unwrap_or_default()
}

/// An unsigned token for `username` that expired an hour ago.
#[must_use]
pub fn expired_token(username: &str) -> String {
    let claims = TokenClaims {
        sub: username.to_string(),
        admin: false,
        exp: (Utc::now() - chrono::Duration::hours(1)).timestamp(),
        iat: (Utc::now() - chrono::Duration::hours(2)).timestamp(),
    };
    encode_unsigned_token(&claims).unwrap_or_default()
}

/// Connection settings with millisecond-scale timers for fast tests.
#[must_use]
pub fn fast_connection_settings() -> ConnectionSettings {
    ConnectionSettings {
        direct_send_base_delay: Duration::from_millis(1),
        health_interval: Duration::from_millis(20),
        ping_timeout: Duration::from_millis(200),
        recovery_base_delay: Duration::from_millis(1),
        recovery_max_delay: Duration::from_millis(5),
        close_timeout: Duration::from_millis(500),
        ..ConnectionSettings::default()
    }
}
