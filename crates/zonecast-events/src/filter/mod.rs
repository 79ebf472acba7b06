//! Per-principal event filtering.
//!
//! Before an event reaches a principal's connection it passes through an
//! ordered chain of [`EventFilter`]s. Each filter returns a
//! [`FilterDecision`]: allow the event through, deny it with a reason, or
//! modify the payload (redaction). Filters run in ascending priority
//! order, so the cheap rejections go first:
//!
//! 1. [`RateLimitFilter`] (priority 5): per (principal, event type)
//!    sliding windows with type-specific limits
//! 2. [`PermissionFilter`] (priority 10): role and permission checks,
//!    sensitive-field stripping for non-administrators
//! 3. [`SensitivityFilter`] (priority 20): recursive payload redaction of
//!    secrets and personal data
//!
//! A filter that fails with an error is counted and treated as a deny for
//! that principal only; filtering for everyone else proceeds.

mod chain;
mod permission;
mod rate_limit;
mod sensitivity;

pub use chain::{ChainVerdict, FilterChain};
pub use permission::PermissionFilter;
pub use rate_limit::{RateLimitFilter, RateLimitSettings};
pub use sensitivity::SensitivityFilter;

use crate::error::FilterError;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use zonecast_core::{Event, Principal};

/// What a filter decided for one (event, principal) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    /// Deliver the event unchanged
    Allow,
    /// Do not deliver the event
    Deny {
        /// Why the event was denied
        reason: String,
    },
    /// Deliver a modified payload instead of the original
    Modify {
        /// The replacement payload
        payload: serde_json::Value,
        /// Why the payload was modified
        reason: String,
    },
}

impl FilterDecision {
    /// Shorthand for a deny decision.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
        }
    }

    /// Shorthand for a modify decision.
    #[must_use]
    pub fn modify(payload: serde_json::Value, reason: impl Into<String>) -> Self {
        Self::Modify {
            payload,
            reason: reason.into(),
        }
    }

    /// Whether this decision lets the event through (possibly modified).
    #[must_use]
    pub fn delivers(&self) -> bool {
        !matches!(self, Self::Deny { .. })
    }
}

/// One stage of the filter chain.
#[async_trait::async_trait]
pub trait EventFilter: Send + Sync {
    /// Stable name used in logs and stats.
    fn name(&self) -> &'static str;

    /// Evaluation order; lower runs first.
    fn priority(&self) -> u32;

    /// Decide what happens to `event` for `principal`.
    async fn apply(
        &self,
        event: &Event,
        principal: &Principal,
    ) -> Result<FilterDecision, FilterError>;

    /// This filter's decision counters.
    fn counters(&self) -> &FilterCounters;

    /// Snapshot this filter's statistics.
    fn stats(&self) -> FilterStats {
        self.counters().snapshot(self.name(), self.priority())
    }
}

/// Atomic decision counters held by each filter.
#[derive(Debug, Default)]
pub struct FilterCounters {
    allowed: AtomicU64,
    denied: AtomicU64,
    modified: AtomicU64,
    errors: AtomicU64,
}

impl FilterCounters {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one filter outcome.
    pub fn record(&self, outcome: &Result<FilterDecision, FilterError>) {
        let counter = match outcome {
            Ok(FilterDecision::Allow) => &self.allowed,
            Ok(FilterDecision::Deny { .. }) => &self.denied,
            Ok(FilterDecision::Modify { .. }) => &self.modified,
            Err(_) => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot into a serializable stats struct.
    #[must_use]
    pub fn snapshot(&self, name: &str, priority: u32) -> FilterStats {
        FilterStats {
            name: name.to_string(),
            priority,
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            modified: self.modified.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time statistics for one filter.
#[derive(Debug, Clone, Serialize)]
pub struct FilterStats {
    /// Filter name
    pub name: String,
    /// Evaluation priority
    pub priority: u32,
    /// Events allowed through unchanged
    pub allowed: u64,
    /// Events denied
    pub denied: u64,
    /// Events delivered with a modified payload
    pub modified: u64,
    /// Filter evaluation failures (treated as denies)
    pub errors: u64,
}
