//! Prelude module - commonly used types for convenient import.
//!
//! Use `use zonecast_events::prelude::*;` to import all essential types.
//!
//! # Example
//!
//! ```rust
//! use zonecast_events::prelude::*;
//! use zonecast_core::{Event, EventType, Principal};
//!
//! let manager = SubscriptionManager::default();
//! let operator = Principal::new("alice");
//! manager.register(&operator);
//!
//! let event = Event::new(EventType::ZoneUpdated, serde_json::json!({}));
//! assert!(manager.is_subscribed(operator.id, &event));
//! ```

// Subscriptions
pub use crate::{
    ActiveSubscription, CategorySubscribeOutcome, SubscribeOutcome, Subscription,
    SubscriptionCriteria, SubscriptionError, SubscriptionId, SubscriptionInfo, SubscriptionLimits,
    SubscriptionManager, SubscriptionProfile, SubscriptionResult, UnsubscribeOutcome,
};

// Filtering
pub use crate::{
    ChainVerdict, EventFilter, FilterChain, FilterDecision, FilterError, FilterStats,
    PermissionFilter, RateLimitFilter, RateLimitSettings, SensitivityFilter,
};

// Routing
pub use crate::{
    DispatchError, EventDispatcher, EventRouter, RouterError, RouterResult, RouterSettings,
    RouterStats, RoutingDecision, RoutingResult, RoutingRule, RuleAction, RuleCondition,
    RuleEngine,
};
