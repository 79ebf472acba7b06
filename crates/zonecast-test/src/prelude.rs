//! Prelude module - commonly used test helpers for convenient import.
//!
//! Use `use zonecast_test::prelude::*;` to import all essential helpers.

pub use crate::fixtures::{
    admin, event_of, expired_token, fast_connection_settings, health_event, operator,
    record_event, security_event, signed_token, signing_key, unsigned_token,
};
pub use crate::harness::{GatewayHarness, HarnessSettings};
pub use crate::mocks::MockSink;
