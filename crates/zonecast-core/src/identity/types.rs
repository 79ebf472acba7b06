use crate::event::EventType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

/// Rate-limit allowance multiplier granted to administrators.
pub const ADMIN_RATE_ALLOWANCE: u32 = 2;

/// Default subscription set for non-administrator principals.
///
/// Operators start with the day-to-day signal: zone and record mutations,
/// health, security alerts, and operator notices. Everything else is opt-in
/// through the subscription manager.
pub const OPERATOR_DEFAULT_SUBSCRIPTIONS: &[EventType] = &[
    EventType::HealthUpdate,
    EventType::ZoneCreated,
    EventType::ZoneUpdated,
    EventType::ZoneDeleted,
    EventType::RecordCreated,
    EventType::RecordUpdated,
    EventType::RecordDeleted,
    EventType::SecurityAlert,
    EventType::SystemNotice,
];

/// Unique identifier for a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrincipalId(pub Uuid);

impl PrincipalId {
    /// Create a new random principal ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a principal ID from a UUID.
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for PrincipalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "principal:{}", self.0)
    }
}

/// An authenticated user of the control plane.
///
/// Immutable for the lifetime of a connection; the authenticator
/// re-validates against the durable store on session refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Unique identifier
    pub id: PrincipalId,
    /// Login name, unique across the store
    pub username: String,
    /// Whether this principal holds the administrator role
    pub admin: bool,
    /// Deactivated principals cannot authenticate
    pub active: bool,
    /// When the principal was created
    pub created_at: DateTime<Utc>,
}

impl Principal {
    /// Create a new active, non-administrator principal.
    #[must_use]
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            id: PrincipalId::new(),
            username: username.into(),
            admin: false,
            active: true,
            created_at: Utc::now(),
        }
    }

    /// Use a specific principal ID.
    #[must_use]
    pub fn with_id(mut self, id: PrincipalId) -> Self {
        self.id = id;
        self
    }

    /// Grant the administrator role.
    #[must_use]
    pub fn with_admin(mut self) -> Self {
        self.admin = true;
        self
    }

    /// Mark the principal as deactivated.
    #[must_use]
    pub fn deactivated(mut self) -> Self {
        self.active = false;
        self
    }

    /// Compute the permission set for this principal.
    #[must_use]
    pub fn permissions(&self) -> PermissionSet {
        PermissionSet::for_principal(self)
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.username, &self.id.0.to_string()[..8])
    }
}

/// The event types a principal may see, plus their rate allowance.
///
/// Derived from the principal's role: administrators see every type and
/// carry a [`ADMIN_RATE_ALLOWANCE`] multiplier on rate limits; everyone
/// else sees all types outside the admin-only `user` category at the base
/// allowance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    admin: bool,
    allowed: HashSet<EventType>,
    rate_allowance: u32,
}

impl PermissionSet {
    /// Compute the permission set for a principal.
    #[must_use]
    pub fn for_principal(principal: &Principal) -> Self {
        let allowed: HashSet<EventType> = if principal.admin {
            EventType::ALL.iter().copied().collect()
        } else {
            EventType::ALL
                .iter()
                .copied()
                .filter(|ty| !ty.is_admin_only())
                .collect()
        };
        Self {
            admin: principal.admin,
            allowed,
            rate_allowance: if principal.admin {
                ADMIN_RATE_ALLOWANCE
            } else {
                1
            },
        }
    }

    /// Whether this permission set covers an event type.
    #[must_use]
    pub fn allows(&self, event_type: EventType) -> bool {
        self.allowed.contains(&event_type)
    }

    /// Whether the holder is an administrator.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.admin
    }

    /// The rate-limit allowance multiplier.
    #[must_use]
    pub fn rate_allowance(&self) -> u32 {
        self.rate_allowance
    }

    /// The full set of allowed event types.
    #[must_use]
    pub fn allowed_types(&self) -> &HashSet<EventType> {
        &self.allowed
    }

    /// The subscription set a fresh connection starts with.
    ///
    /// Administrators default to every type; operators default to
    /// [`OPERATOR_DEFAULT_SUBSCRIPTIONS`].
    #[must_use]
    pub fn default_subscriptions(&self) -> HashSet<EventType> {
        if self.admin {
            self.allowed.clone()
        } else {
            OPERATOR_DEFAULT_SUBSCRIPTIONS.iter().copied().collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventCategory;

    #[test]
    fn operator_permissions_exclude_user_category() {
        let operator = Principal::new("alice");
        let perms = operator.permissions();

        assert!(!perms.is_admin());
        assert_eq!(perms.rate_allowance(), 1);
        assert!(perms.allows(EventType::RecordUpdated));
        assert!(perms.allows(EventType::SecurityAlert));
        for ty in EventCategory::User.member_types() {
            assert!(!perms.allows(ty), "{ty} should be admin-only");
        }
    }

    #[test]
    fn admin_permissions_cover_everything() {
        let admin = Principal::new("root").with_admin();
        let perms = admin.permissions();

        assert!(perms.is_admin());
        assert_eq!(perms.rate_allowance(), ADMIN_RATE_ALLOWANCE);
        for ty in EventType::ALL {
            assert!(perms.allows(*ty));
        }
    }

    #[test]
    fn operator_defaults_are_a_subset_of_allowed() {
        let perms = Principal::new("bob").permissions();
        let defaults = perms.default_subscriptions();

        assert!(defaults.contains(&EventType::RecordUpdated));
        assert!(!defaults.contains(&EventType::SessionStarted));
        for ty in &defaults {
            assert!(perms.allows(*ty));
        }
    }

    #[test]
    fn principal_builder_flags() {
        let p = Principal::new("carol").with_admin().deactivated();
        assert!(p.admin);
        assert!(!p.active);
        assert_eq!(p.username, "carol");
    }
}
