//! Zonecast Core - Foundation types for the Zonecast event distribution layer.
//!
//! This crate provides:
//! - Principal identity and permission types
//! - The event model: types, categories, priorities, payloads
//! - The `PrincipalStore` trait for durable principal lookup
//! - Error types shared across the workspace
//!
//! Zonecast is the real-time distribution layer of a DNS-management control
//! plane: server-side state changes (zone and record edits, health
//! transitions, security alerts) become [`Event`] values that are routed to
//! connected principals over persistent connections. This crate is the leaf
//! of the workspace; it knows nothing about transports or routing.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

pub mod error;
pub mod event;
pub mod identity;

pub use error::{CoreError, CoreResult};
pub use event::{Event, EventCategory, EventId, EventPriority, EventType, OutboundEventMessage};
pub use identity::{
    InMemoryPrincipalStore, PermissionSet, Principal, PrincipalId, PrincipalStore,
};
