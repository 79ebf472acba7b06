//! Per-principal, per-event-type rate limiting.
//!
//! Runs first in the chain (priority 5) so that over-limit traffic is
//! rejected before any permission or redaction work. Each (principal,
//! event type) pair gets its own fixed window; crossing the limit blocks
//! the pair for the remainder of the window, with a configurable floor so
//! short windows still produce a meaningful block.

use super::{EventFilter, FilterCounters, FilterDecision};
use crate::error::FilterError;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::debug;
use zonecast_core::{Event, EventType, Principal, PrincipalId};

/// Rate limiting configuration.
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    /// Window length
    pub window: Duration,
    /// Per-window limit for types without a specific limit
    pub default_limit: u32,
    /// Multiplier applied to every limit for administrators
    pub admin_multiplier: u32,
    /// Minimum block duration once a limit is crossed
    pub min_block: Duration,
    /// Windows idle this long are evicted by the sweep
    pub idle_eviction: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window: Duration::seconds(60),
            default_limit: 30,
            admin_multiplier: 5,
            min_block: Duration::seconds(60),
            idle_eviction: Duration::hours(1),
        }
    }
}

impl RateLimitSettings {
    /// The per-window limit for one event type, before the admin multiplier.
    ///
    /// High-churn record mutations get generous limits; noisy low-value
    /// types (health probes) and high-severity types (security alerts) are
    /// kept tight.
    #[must_use]
    pub fn base_limit(&self, event_type: EventType) -> u32 {
        match event_type {
            EventType::HealthUpdate => 10,
            EventType::RecordUpdated => 200,
            EventType::RecordCreated | EventType::RecordDeleted => 100,
            EventType::SecurityAlert => 5,
            EventType::ZoneCreated | EventType::ZoneUpdated | EventType::ZoneDeleted => 60,
            _ => self.default_limit,
        }
    }

    /// The effective limit for a principal.
    #[must_use]
    pub fn limit_for(&self, event_type: EventType, admin: bool) -> u32 {
        let base = self.base_limit(event_type);
        if admin {
            base.saturating_mul(self.admin_multiplier)
        } else {
            base
        }
    }
}

/// State of one (principal, event type) window.
#[derive(Debug)]
struct RateLimitWindow {
    count: u32,
    window_start: DateTime<Utc>,
    last_event: DateTime<Utc>,
    blocked_until: Option<DateTime<Utc>>,
}

impl RateLimitWindow {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            window_start: now,
            last_event: now,
            blocked_until: None,
        }
    }

    fn reset(&mut self, now: DateTime<Utc>) {
        self.count = 0;
        self.window_start = now;
        self.blocked_until = None;
    }
}

/// The rate-limiting stage of the filter chain.
#[derive(Debug)]
pub struct RateLimitFilter {
    settings: RateLimitSettings,
    windows: DashMap<(PrincipalId, EventType), RateLimitWindow>,
    counters: FilterCounters,
}

impl Default for RateLimitFilter {
    fn default() -> Self {
        Self::new(RateLimitSettings::default())
    }
}

impl RateLimitFilter {
    /// Create a rate-limit filter with the given settings.
    #[must_use]
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            windows: DashMap::new(),
            counters: FilterCounters::new(),
        }
    }

    fn check(&self, principal: &Principal, event_type: EventType) -> FilterDecision {
        let now = Utc::now();
        let limit = self.settings.limit_for(event_type, principal.admin);
        let deny_reason = || {
            format!(
                "Rate limit exceeded: {limit} events per {} seconds",
                self.settings.window.num_seconds()
            )
        };

        let mut entry = self
            .windows
            .entry((principal.id, event_type))
            .or_insert_with(|| RateLimitWindow::new(now));
        let window = entry.value_mut();
        window.last_event = now;

        if let Some(until) = window.blocked_until {
            if now < until {
                return FilterDecision::deny(deny_reason());
            }
            window.reset(now);
        } else if now - window.window_start >= self.settings.window {
            window.reset(now);
        }

        window.count = window.count.saturating_add(1);
        if window.count > limit {
            let remainder = self.settings.window - (now - window.window_start);
            let block = remainder.max(self.settings.min_block);
            window.blocked_until = Some(now + block);
            debug!(
                principal = %principal.id,
                event_type = %event_type,
                limit,
                block_secs = block.num_seconds(),
                "rate limit crossed"
            );
            FilterDecision::deny(deny_reason())
        } else {
            FilterDecision::Allow
        }
    }

    /// Evict windows that have been idle longer than the eviction horizon.
    ///
    /// Returns the number evicted. Called from the background sweep.
    pub fn sweep_idle(&self) -> usize {
        let horizon = Utc::now() - self.settings.idle_eviction;
        let before = self.windows.len();
        self.windows.retain(|_, window| window.last_event > horizon);
        let evicted = before.saturating_sub(self.windows.len());
        if evicted > 0 {
            debug!(evicted, "evicted idle rate-limit windows");
        }
        evicted
    }

    /// Number of live windows.
    #[must_use]
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }
}

#[async_trait::async_trait]
impl EventFilter for RateLimitFilter {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn priority(&self) -> u32 {
        5
    }

    async fn apply(
        &self,
        event: &Event,
        principal: &Principal,
    ) -> Result<FilterDecision, FilterError> {
        Ok(self.check(principal, event.event_type))
    }

    fn counters(&self) -> &FilterCounters {
        &self.counters
    }
}
