//! The ordered filter pipeline.

use super::{
    EventFilter, FilterDecision, FilterStats, PermissionFilter, RateLimitFilter,
    RateLimitSettings, SensitivityFilter,
};
use std::sync::Arc;
use tracing::warn;
use zonecast_core::{Event, Principal};

/// The chain's overall verdict for one (event, principal) pair.
#[derive(Debug, Clone)]
pub struct ChainVerdict {
    /// Whether the event should be delivered
    pub deliver: bool,
    /// The payload to deliver; meaningless when `deliver` is false
    pub payload: serde_json::Value,
    /// Deny reason, or the accumulated modification reasons
    pub reason: Option<String>,
}

impl ChainVerdict {
    fn denied(reason: String) -> Self {
        Self {
            deliver: false,
            payload: serde_json::Value::Null,
            reason: Some(reason),
        }
    }
}

/// An ordered set of [`EventFilter`]s applied per (event, principal) pair.
///
/// Filters are kept sorted by ascending priority. A deny short-circuits
/// the rest of the chain; a modify feeds the modified payload to the next
/// filter. A filter error is counted against that filter and fails closed
/// to a deny for the affected principal only.
#[derive(Clone)]
pub struct FilterChain {
    filters: Vec<Arc<dyn EventFilter>>,
}

impl Default for FilterChain {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterChain {
    /// Create an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
        }
    }

    /// The standard chain: rate limiting, permissions, sensitivity.
    #[must_use]
    pub fn standard(rate_settings: RateLimitSettings) -> Self {
        Self::standard_with(Arc::new(RateLimitFilter::new(rate_settings)))
    }

    /// The standard chain around a shared rate-limit filter.
    ///
    /// Callers that run the idle-window sweep keep their own handle on
    /// the filter and pass it in here.
    #[must_use]
    pub fn standard_with(rate_filter: Arc<RateLimitFilter>) -> Self {
        Self::new()
            .with_filter(rate_filter)
            .with_filter(Arc::new(PermissionFilter::new()))
            .with_filter(Arc::new(SensitivityFilter::new()))
    }

    /// Add a filter, keeping the chain sorted by priority.
    #[must_use]
    pub fn with_filter(mut self, filter: Arc<dyn EventFilter>) -> Self {
        self.filters.push(filter);
        self.filters.sort_by_key(|f| f.priority());
        self
    }

    /// Run the chain for one (event, principal) pair.
    pub async fn filter(&self, event: &Event, principal: &Principal) -> ChainVerdict {
        let mut working = event.clone();
        let mut modifications: Vec<String> = Vec::new();

        for filter in &self.filters {
            let outcome = filter.apply(&working, principal).await;
            filter.counters().record(&outcome);
            match outcome {
                Ok(FilterDecision::Allow) => {},
                Ok(FilterDecision::Deny { reason }) => {
                    return ChainVerdict::denied(reason);
                },
                Ok(FilterDecision::Modify { payload, reason }) => {
                    working.data = payload;
                    modifications.push(reason);
                },
                Err(e) => {
                    warn!(
                        filter = filter.name(),
                        principal = %principal.id,
                        event = %event.id,
                        error = %e,
                        "filter failed, denying delivery"
                    );
                    return ChainVerdict::denied(format!("filter failure: {e}"));
                },
            }
        }

        ChainVerdict {
            deliver: true,
            payload: working.data,
            reason: if modifications.is_empty() {
                None
            } else {
                Some(modifications.join("; "))
            },
        }
    }

    /// Snapshot every filter's statistics, in chain order.
    #[must_use]
    pub fn stats(&self) -> Vec<FilterStats> {
        self.filters.iter().map(|f| f.stats()).collect()
    }

    /// Number of filters in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Whether the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Access the filters in priority order.
    #[must_use]
    pub fn filters(&self) -> &[Arc<dyn EventFilter>] {
        &self.filters
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.filters.iter().map(|x| x.name()).collect();
        f.debug_struct("FilterChain").field("filters", &names).finish()
    }
}
