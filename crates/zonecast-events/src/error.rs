//! Error types for subscriptions, filtering, and routing.

use thiserror::Error;
use zonecast_core::{EventCategory, EventType};

/// Errors from subscription management.
///
/// Per-item rejections inside a partially successful subscribe call are
/// reported as strings in the outcome, not as errors; these variants cover
/// requests that fail outright.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// The principal already holds the maximum number of subscribed types
    #[error("subscription limit reached: {limit} event types")]
    TypeLimitReached {
        /// The enforced limit
        limit: u32,
    },

    /// The principal already holds the maximum number of subscribed categories
    #[error("subscription limit reached: {limit} categories")]
    CategoryLimitReached {
        /// The enforced limit
        limit: u32,
    },

    /// The requested category is restricted to administrators
    #[error("category {0} is restricted to administrators")]
    CategoryNotPermitted(EventCategory),

    /// The requested event type is outside the principal's permissions
    #[error("event type {0} is not permitted")]
    TypeNotPermitted(EventType),

    /// No profile exists for the principal
    #[error("no subscription profile for principal {0}")]
    UnknownPrincipal(String),
}

/// Result type for subscription operations.
pub type SubscriptionResult<T> = Result<T, SubscriptionError>;

/// A filter failed to evaluate.
///
/// Decisions (allow, deny, modify) are values, not errors; this is for
/// genuinely exceptional conditions inside a filter. The chain treats a
/// failed filter as a deny for the affected principal only.
#[derive(Debug, Error)]
#[error("filter {filter} failed: {reason}")]
pub struct FilterError {
    /// Name of the failing filter
    pub filter: String,
    /// What went wrong
    pub reason: String,
}

impl FilterError {
    /// Create a new filter error.
    #[must_use]
    pub fn new(filter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            reason: reason.into(),
        }
    }
}

/// Errors from the event router.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The emit queue is closed because the router was shut down
    #[error("router is shut down")]
    Closed,
}

/// Result type for router operations.
pub type RouterResult<T> = Result<T, RouterError>;

/// Delivery to a single principal failed.
///
/// Returned by [`EventDispatcher::dispatch`](crate::EventDispatcher::dispatch)
/// implementations; the router logs the failure and continues with the
/// remaining targets.
#[derive(Debug, Error)]
#[error("dispatch to {principal} failed: {reason}")]
pub struct DispatchError {
    /// The principal the delivery was for
    pub principal: String,
    /// What went wrong
    pub reason: String,
}

impl DispatchError {
    /// Create a new dispatch error.
    #[must_use]
    pub fn new(principal: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            reason: reason.into(),
        }
    }
}
