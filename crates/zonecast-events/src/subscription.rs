//! Dynamic, expiring, limited event subscriptions.
//!
//! Each principal owns one [`SubscriptionProfile`]: the role-based default
//! types seeded at registration plus any dynamic [`Subscription`]s added at
//! runtime. The effective subscribed set is the union of both; the router
//! consults [`SubscriptionManager::is_subscribed`] as the single source of
//! truth, so a principal that never subscribed to an event type never
//! reaches the filter pipeline for it.
//!
//! Subscriptions expire: every dynamic subscription carries a TTL chosen by
//! role, and a periodic sweep deletes the expired ones.

use crate::error::{SubscriptionError, SubscriptionResult};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, info};
use uuid::Uuid;
use zonecast_core::{Event, EventCategory, EventPriority, EventType, Principal, PrincipalId};

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    /// Create a new random subscription ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscription:{}", self.0)
    }
}

/// What a subscription matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubscriptionCriteria {
    /// A list of concrete event types
    EventTypes {
        /// The subscribed types
        types: Vec<EventType>,
    },
    /// Every member type of the listed categories
    Categories {
        /// The subscribed categories
        categories: Vec<EventCategory>,
    },
    /// Any event at or above a minimum priority
    PriorityFloor {
        /// The minimum priority
        minimum: EventPriority,
    },
    /// Event types whose snake_case name matches a `*` wildcard pattern
    Pattern {
        /// The wildcard pattern, e.g. `record_*`
        pattern: String,
    },
}

impl SubscriptionCriteria {
    /// Whether an event falls under these criteria.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Self::EventTypes { types } => types.contains(&event.event_type),
            Self::Categories { categories } => categories.contains(&event.event_type.category()),
            Self::PriorityFloor { minimum } => event.priority >= *minimum,
            Self::Pattern { pattern } => wildcard_match(pattern, event.event_type.as_str()),
        }
    }
}

/// Match a name against a single-`*` wildcard pattern.
fn wildcard_match(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return name.starts_with(prefix);
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        return name.ends_with(suffix);
    }
    pattern == name
}

/// One dynamic subscription held by a principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Unique identifier
    pub id: SubscriptionId,
    /// The owning principal
    pub principal: PrincipalId,
    /// What this subscription matches
    pub criteria: SubscriptionCriteria,
    /// When the subscription was created
    pub created_at: DateTime<Utc>,
    /// When the subscription expires
    pub expires_at: DateTime<Utc>,
    /// Inactive subscriptions are ignored without being deleted
    pub active: bool,
}

impl Subscription {
    /// Create a new active subscription expiring after `ttl`.
    #[must_use]
    pub fn new(principal: PrincipalId, criteria: SubscriptionCriteria, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: SubscriptionId::new(),
            principal,
            criteria,
            created_at: now,
            expires_at: now + ttl,
            active: true,
        }
    }

    /// Check if this subscription has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Active and not expired.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.active && !self.is_expired()
    }

    /// Whether this subscription currently matches an event.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        self.is_live() && self.criteria.matches(event)
    }
}

/// Per-role subscription limits and lifetimes.
#[derive(Debug, Clone)]
pub struct SubscriptionLimits {
    /// Maximum dynamically subscribed event types for operators
    pub max_types: u32,
    /// Maximum dynamically subscribed event types for administrators
    pub max_types_admin: u32,
    /// Maximum subscribed categories for operators
    pub max_categories: u32,
    /// Maximum subscribed categories for administrators
    pub max_categories_admin: u32,
    /// Subscription lifetime for operators
    pub ttl: Duration,
    /// Subscription lifetime for administrators
    pub ttl_admin: Duration,
}

impl Default for SubscriptionLimits {
    fn default() -> Self {
        Self {
            max_types: 50,
            max_types_admin: 200,
            max_categories: 20,
            max_categories_admin: 100,
            ttl: Duration::hours(24),
            ttl_admin: Duration::hours(168),
        }
    }
}

impl SubscriptionLimits {
    fn type_limit(&self, admin: bool) -> u32 {
        if admin { self.max_types_admin } else { self.max_types }
    }

    fn category_limit(&self, admin: bool) -> u32 {
        if admin {
            self.max_categories_admin
        } else {
            self.max_categories
        }
    }

    fn ttl_for(&self, admin: bool) -> Duration {
        if admin { self.ttl_admin } else { self.ttl }
    }
}

/// A principal's complete subscription state.
#[derive(Debug, Clone)]
pub struct SubscriptionProfile {
    /// The owning principal
    pub principal: PrincipalId,
    /// Role-based default types, seeded at registration
    pub defaults: HashSet<EventType>,
    /// Dynamic subscriptions
    pub subscriptions: Vec<Subscription>,
}

impl SubscriptionProfile {
    fn new(principal: &Principal) -> Self {
        Self {
            principal: principal.id,
            defaults: principal.permissions().default_subscriptions(),
            subscriptions: Vec::new(),
        }
    }

    /// Distinct event types across live type-list subscriptions.
    fn dynamic_type_count(&self) -> usize {
        let mut types: HashSet<EventType> = HashSet::new();
        for sub in self.subscriptions.iter().filter(|s| s.is_live()) {
            if let SubscriptionCriteria::EventTypes { types: t } = &sub.criteria {
                types.extend(t.iter().copied());
            }
        }
        types.len()
    }

    /// Distinct categories across live category subscriptions.
    fn dynamic_category_count(&self) -> usize {
        let mut categories: HashSet<EventCategory> = HashSet::new();
        for sub in self.subscriptions.iter().filter(|s| s.is_live()) {
            if let SubscriptionCriteria::Categories { categories: c } = &sub.criteria {
                categories.extend(c.iter().copied());
            }
        }
        categories.len()
    }

    /// Whether `ty` is already part of the effective set via defaults or a
    /// live type-list subscription.
    fn covers_type(&self, ty: EventType) -> bool {
        if self.defaults.contains(&ty) {
            return true;
        }
        self.subscriptions.iter().filter(|s| s.is_live()).any(|s| {
            matches!(&s.criteria, SubscriptionCriteria::EventTypes { types } if types.contains(&ty))
        })
    }

    fn covers_category(&self, category: EventCategory) -> bool {
        self.subscriptions.iter().filter(|s| s.is_live()).any(|s| {
            matches!(&s.criteria, SubscriptionCriteria::Categories { categories } if categories.contains(&category))
        })
    }
}

/// Result of a partially successful subscribe call.
///
/// `accepted` lists what was actually subscribed; `errors` carries one
/// human-readable line per rejected item. Both can be non-empty at once.
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeOutcome {
    /// Types accepted into a new subscription
    pub accepted: Vec<EventType>,
    /// Per-item rejection reasons
    pub errors: Vec<String>,
    /// Expiry of the created subscription, if one was created
    pub expires_at: Option<DateTime<Utc>>,
}

/// Result of a partially successful category subscribe call.
#[derive(Debug, Clone, Serialize)]
pub struct CategorySubscribeOutcome {
    /// Categories accepted into a new subscription
    pub accepted: Vec<EventCategory>,
    /// Per-item rejection reasons
    pub errors: Vec<String>,
    /// Expiry of the created subscription, if one was created
    pub expires_at: Option<DateTime<Utc>>,
}

/// Result of an unsubscribe call.
#[derive(Debug, Clone, Serialize)]
pub struct UnsubscribeOutcome {
    /// Types removed from dynamic subscriptions
    pub removed: Vec<EventType>,
    /// Per-item reasons for types that were not removed
    pub errors: Vec<String>,
}

/// Introspection snapshot of one principal's subscriptions.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    /// The principal
    pub principal: PrincipalId,
    /// Role-based default types, sorted by name
    pub default_types: Vec<EventType>,
    /// Live dynamic subscriptions
    pub subscriptions: Vec<ActiveSubscription>,
    /// Remaining dynamic type quota
    pub remaining_types: u32,
    /// Remaining category quota
    pub remaining_categories: u32,
}

/// One live subscription in a [`SubscriptionInfo`] snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveSubscription {
    /// Subscription identifier
    pub id: SubscriptionId,
    /// What it matches
    pub criteria: SubscriptionCriteria,
    /// When it expires
    pub expires_at: DateTime<Utc>,
}

/// Owns every principal's subscription profile.
///
/// Thread-safe; shared behind an `Arc` between the router, the control
/// handler, and the background expiry sweep.
#[derive(Debug)]
pub struct SubscriptionManager {
    limits: SubscriptionLimits,
    profiles: DashMap<PrincipalId, SubscriptionProfile>,
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new(SubscriptionLimits::default())
    }
}

impl SubscriptionManager {
    /// Create a manager with the given limits.
    #[must_use]
    pub fn new(limits: SubscriptionLimits) -> Self {
        Self {
            limits,
            profiles: DashMap::new(),
        }
    }

    /// Ensure a profile exists for a connecting principal.
    ///
    /// First registration seeds the role defaults. Re-registration (a
    /// reconnect) refreshes the defaults from the principal's current role
    /// and keeps dynamic subscriptions, which outlive connections until
    /// their TTL.
    pub fn register(&self, principal: &Principal) {
        let defaults = principal.permissions().default_subscriptions();
        self.profiles
            .entry(principal.id)
            .and_modify(|profile| profile.defaults = defaults.clone())
            .or_insert_with(|| {
                debug!(principal = %principal.id, "created subscription profile");
                SubscriptionProfile::new(principal)
            });
    }

    /// Subscribe a principal to a list of event types.
    ///
    /// Fails outright when the type quota is already exhausted. Otherwise
    /// each requested type is checked individually: types outside the
    /// principal's permissions, duplicates of the effective set, and types
    /// beyond the remaining quota are reported in the outcome's `errors`
    /// while the rest are accepted.
    pub fn subscribe(
        &self,
        principal: &Principal,
        types: &[EventType],
    ) -> SubscriptionResult<SubscribeOutcome> {
        let perms = principal.permissions();
        let limit = self.limits.type_limit(principal.admin);
        let ttl = self.limits.ttl_for(principal.admin);

        let mut entry = self
            .profiles
            .entry(principal.id)
            .or_insert_with(|| SubscriptionProfile::new(principal));
        let profile = entry.value_mut();

        let current = profile.dynamic_type_count();
        if current >= limit as usize {
            return Err(SubscriptionError::TypeLimitReached { limit });
        }

        let mut accepted: Vec<EventType> = Vec::new();
        let mut errors: Vec<String> = Vec::new();
        for ty in types {
            if !perms.allows(*ty) {
                errors.push(format!("{ty}: not permitted"));
            } else if profile.covers_type(*ty) || accepted.contains(ty) {
                errors.push(format!("{ty}: already subscribed"));
            } else if current.saturating_add(accepted.len()) >= limit as usize {
                errors.push(format!("{ty}: subscription limit reached ({limit})"));
            } else {
                accepted.push(*ty);
            }
        }

        let expires_at = if accepted.is_empty() {
            None
        } else {
            let subscription = Subscription::new(
                principal.id,
                SubscriptionCriteria::EventTypes {
                    types: accepted.clone(),
                },
                ttl,
            );
            let expires = subscription.expires_at;
            info!(
                principal = %principal.id,
                subscription = %subscription.id,
                count = accepted.len(),
                "subscribed to event types"
            );
            profile.subscriptions.push(subscription);
            Some(expires)
        };

        Ok(SubscribeOutcome {
            accepted,
            errors,
            expires_at,
        })
    }

    /// Subscribe a principal to whole categories.
    ///
    /// The `user` category is restricted to administrators. Limits and
    /// partial success follow the same discipline as [`subscribe`].
    ///
    /// [`subscribe`]: Self::subscribe
    pub fn subscribe_to_categories(
        &self,
        principal: &Principal,
        categories: &[EventCategory],
    ) -> SubscriptionResult<CategorySubscribeOutcome> {
        let limit = self.limits.category_limit(principal.admin);
        let ttl = self.limits.ttl_for(principal.admin);

        let mut entry = self
            .profiles
            .entry(principal.id)
            .or_insert_with(|| SubscriptionProfile::new(principal));
        let profile = entry.value_mut();

        let current = profile.dynamic_category_count();
        if current >= limit as usize {
            return Err(SubscriptionError::CategoryLimitReached { limit });
        }

        let mut accepted: Vec<EventCategory> = Vec::new();
        let mut errors: Vec<String> = Vec::new();
        for category in categories {
            if category.is_admin_only() && !principal.admin {
                errors.push(format!("{category}: restricted to administrators"));
            } else if profile.covers_category(*category) || accepted.contains(category) {
                errors.push(format!("{category}: already subscribed"));
            } else if current.saturating_add(accepted.len()) >= limit as usize {
                errors.push(format!("{category}: category limit reached ({limit})"));
            } else {
                accepted.push(*category);
            }
        }

        let expires_at = if accepted.is_empty() {
            None
        } else {
            let subscription = Subscription::new(
                principal.id,
                SubscriptionCriteria::Categories {
                    categories: accepted.clone(),
                },
                ttl,
            );
            let expires = subscription.expires_at;
            info!(
                principal = %principal.id,
                subscription = %subscription.id,
                count = accepted.len(),
                "subscribed to categories"
            );
            profile.subscriptions.push(subscription);
            Some(expires)
        };

        Ok(CategorySubscribeOutcome {
            accepted,
            errors,
            expires_at,
        })
    }

    /// Add a single subscription with arbitrary criteria, all or nothing.
    ///
    /// This is the programmatic API covering the priority-floor and
    /// pattern kinds, which have no dedicated control message. Unlike
    /// [`subscribe`], any impermissible part fails the whole call.
    ///
    /// [`subscribe`]: Self::subscribe
    pub fn subscribe_with(
        &self,
        principal: &Principal,
        criteria: SubscriptionCriteria,
    ) -> SubscriptionResult<SubscriptionId> {
        match &criteria {
            SubscriptionCriteria::EventTypes { types } => {
                let perms = principal.permissions();
                if let Some(denied) = types.iter().find(|ty| !perms.allows(**ty)) {
                    return Err(SubscriptionError::TypeNotPermitted(*denied));
                }
            },
            SubscriptionCriteria::Categories { categories } => {
                if let Some(denied) = categories
                    .iter()
                    .find(|c| c.is_admin_only() && !principal.admin)
                {
                    return Err(SubscriptionError::CategoryNotPermitted(*denied));
                }
            },
            SubscriptionCriteria::PriorityFloor { .. } | SubscriptionCriteria::Pattern { .. } => {},
        }

        let ttl = self.limits.ttl_for(principal.admin);
        let subscription = Subscription::new(principal.id, criteria, ttl);
        let id = subscription.id;
        let mut entry = self
            .profiles
            .entry(principal.id)
            .or_insert_with(|| SubscriptionProfile::new(principal));
        entry.value_mut().subscriptions.push(subscription);
        debug!(principal = %principal.id, subscription = %id, "added subscription");
        Ok(id)
    }

    /// Remove event types from a principal's dynamic subscriptions.
    ///
    /// Multi-type subscriptions keep their residual types; subscriptions
    /// left with no criteria are deleted. Role defaults are not touched.
    pub fn unsubscribe(&self, principal: PrincipalId, types: &[EventType]) -> UnsubscribeOutcome {
        let mut removed: Vec<EventType> = Vec::new();
        let mut errors: Vec<String> = Vec::new();

        let Some(mut entry) = self.profiles.get_mut(&principal) else {
            for ty in types {
                errors.push(format!("{ty}: not subscribed"));
            }
            return UnsubscribeOutcome { removed, errors };
        };
        let profile = entry.value_mut();

        for ty in types {
            let mut found = false;
            for sub in &mut profile.subscriptions {
                if let SubscriptionCriteria::EventTypes { types: list } = &mut sub.criteria {
                    if let Some(pos) = list.iter().position(|t| t == ty) {
                        list.remove(pos);
                        found = true;
                    }
                }
            }
            if found {
                removed.push(*ty);
            } else {
                errors.push(format!("{ty}: not subscribed"));
            }
        }

        // Drop subscriptions whose criteria emptied out.
        profile.subscriptions.retain(|sub| {
            !matches!(&sub.criteria, SubscriptionCriteria::EventTypes { types } if types.is_empty())
        });

        if !removed.is_empty() {
            info!(principal = %principal, count = removed.len(), "unsubscribed from event types");
        }
        UnsubscribeOutcome { removed, errors }
    }

    /// Whether a principal's effective set covers an event.
    ///
    /// The effective set is the union of role defaults and live dynamic
    /// subscriptions. Principals without a profile are not subscribed to
    /// anything.
    #[must_use]
    pub fn is_subscribed(&self, principal: PrincipalId, event: &Event) -> bool {
        let Some(profile) = self.profiles.get(&principal) else {
            return false;
        };
        if profile.defaults.contains(&event.event_type) {
            return true;
        }
        profile.subscriptions.iter().any(|sub| sub.matches(event))
    }

    /// Snapshot one principal's subscription state.
    #[must_use]
    pub fn subscription_info(&self, principal: &Principal) -> Option<SubscriptionInfo> {
        let profile = self.profiles.get(&principal.id)?;

        let mut default_types: Vec<EventType> = profile.defaults.iter().copied().collect();
        default_types.sort_by_key(|ty| ty.as_str());

        let subscriptions: Vec<ActiveSubscription> = profile
            .subscriptions
            .iter()
            .filter(|s| s.is_live())
            .map(|s| ActiveSubscription {
                id: s.id,
                criteria: s.criteria.clone(),
                expires_at: s.expires_at,
            })
            .collect();

        let type_count = profile.dynamic_type_count() as u32;
        let category_count = profile.dynamic_category_count() as u32;
        let type_limit = self.limits.type_limit(principal.admin);
        let category_limit = self.limits.category_limit(principal.admin);

        Some(SubscriptionInfo {
            principal: principal.id,
            default_types,
            subscriptions,
            remaining_types: type_limit.saturating_sub(type_count),
            remaining_categories: category_limit.saturating_sub(category_count),
        })
    }

    /// Delete expired subscriptions across all profiles.
    ///
    /// Returns the number deleted. Called from the background sweep.
    pub fn sweep_expired(&self) -> usize {
        let mut deleted: usize = 0;
        for mut entry in self.profiles.iter_mut() {
            let before = entry.subscriptions.len();
            entry.subscriptions.retain(|sub| !sub.is_expired());
            deleted = deleted.saturating_add(before.saturating_sub(entry.subscriptions.len()));
        }
        if deleted > 0 {
            info!(deleted, "swept expired subscriptions");
        }
        deleted
    }

    /// Number of profiles currently held.
    #[must_use]
    pub fn profile_count(&self) -> usize {
        self.profiles.len()
    }
}
