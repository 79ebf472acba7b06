//! Principal identity and permissions.
//!
//! A [`Principal`] is an authenticated user of the control plane, resolved
//! at connect time through a [`PrincipalStore`]. The principal's role
//! determines its [`PermissionSet`]: which event types it may see and the
//! rate allowance it carries.
//!
//! # Components
//!
//! - [`PrincipalId`] — UUID newtype identifying a principal
//! - [`Principal`] — the account record
//! - [`PermissionSet`] — role-derived event visibility and rate allowance
//! - [`PrincipalStore`] — async lookup trait for durable account storage
//! - [`InMemoryPrincipalStore`] — reference implementation for testing and
//!   small deployments

mod store;
mod types;

pub use store::{InMemoryPrincipalStore, PrincipalStore};
pub use types::{
    ADMIN_RATE_ALLOWANCE, OPERATOR_DEFAULT_SUBSCRIPTIONS, PermissionSet, Principal, PrincipalId,
};
