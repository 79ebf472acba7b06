//! Prelude module - commonly used types for convenient import.
//!
//! Use `use zonecast_core::prelude::*;` to import all essential types.
//!
//! # Example
//!
//! ```rust
//! use zonecast_core::prelude::*;
//!
//! // Now you have access to:
//! // - CoreError, CoreResult
//! // - Event, EventType, EventCategory, EventPriority
//! // - Principal, PrincipalId, PermissionSet
//! // - PrincipalStore trait and the in-memory implementation
//! ```

// Errors
pub use crate::{CoreError, CoreResult};

// Event model
pub use crate::{Event, EventCategory, EventId, EventPriority, EventType, OutboundEventMessage};

// Identity
pub use crate::{InMemoryPrincipalStore, PermissionSet, Principal, PrincipalId, PrincipalStore};
