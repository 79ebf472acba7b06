//! Zonecast Events - Subscription, filtering, and routing for the Zonecast
//! real-time event layer.
//!
//! This crate provides:
//! - Per-principal subscription profiles with dynamic, expiring
//!   subscriptions and role-based quotas
//! - An ordered filter chain (rate limiting, permissions, sensitive-data
//!   redaction) producing a per-principal payload for every delivery
//! - An event router that resolves subscribers, evaluates custom routing
//!   rules, and defers low-priority events under load
//!
//! # Architecture
//!
//! Producers call [`EventRouter::emit`], which queues the event and
//! returns its id immediately. A background drain task routes each event:
//! routing rules run first and may skip, defer, narrow, or rewrite; the
//! [`SubscriptionManager`] then yields the subscribed principals among
//! those connected; the [`FilterChain`] runs per candidate and produces
//! that principal's payload (or drops the delivery); finally the
//! [`EventDispatcher`] hands each frame to the connection layer.
//!
//! # Example
//!
//! ```rust
//! use zonecast_events::{SubscriptionCriteria, SubscriptionManager};
//! use zonecast_core::{Event, EventType, Principal};
//!
//! let manager = SubscriptionManager::default();
//! let operator = Principal::new("alice");
//! manager.register(&operator);
//!
//! // Role defaults cover DNS record changes out of the box.
//! let event = Event::new(EventType::RecordCreated, serde_json::json!({}));
//! assert!(manager.is_subscribed(operator.id, &event));
//!
//! // Dynamic subscriptions widen the set until they expire.
//! let outcome = manager
//!     .subscribe(&operator, &[EventType::MaintenanceScheduled])
//!     .unwrap();
//! assert_eq!(outcome.accepted, vec![EventType::MaintenanceScheduled]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod error;
mod filter;
mod router;
mod rules;
mod subscription;

pub use error::{
    DispatchError, FilterError, RouterError, RouterResult, SubscriptionError, SubscriptionResult,
};
pub use filter::{
    ChainVerdict, EventFilter, FilterChain, FilterCounters, FilterDecision, FilterStats,
    PermissionFilter, RateLimitFilter, RateLimitSettings, SensitivityFilter,
};
pub use router::{
    EventDispatcher, EventRouter, RouterSettings, RouterStats, RoutingDecision, RoutingResult,
};
pub use rules::{
    CandidateRestriction, RoutingRule, RuleAction, RuleCondition, RuleContext, RuleDirective,
    RuleEngine, RuleEvaluation,
};
pub use subscription::{
    ActiveSubscription, CategorySubscribeOutcome, SubscribeOutcome, Subscription,
    SubscriptionCriteria, SubscriptionId, SubscriptionInfo, SubscriptionLimits,
    SubscriptionManager, SubscriptionProfile, UnsubscribeOutcome,
};
