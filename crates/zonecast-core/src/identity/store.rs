use super::types::{Principal, PrincipalId};
use crate::error::{CoreError, CoreResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Durable principal lookup.
///
/// Implementations wrap whatever holds the account records (in-memory,
/// database, directory service) and provide thread-safe access. Lookups
/// return `Ok(None)` for a clean miss; `Err` is reserved for store
/// failures, which the authenticator treats differently from a miss.
#[async_trait::async_trait]
pub trait PrincipalStore: Send + Sync {
    /// Fetch a principal by ID.
    async fn get(&self, id: PrincipalId) -> CoreResult<Option<Principal>>;

    /// Fetch a principal by username.
    async fn get_by_username(&self, username: &str) -> CoreResult<Option<Principal>>;

    /// Insert or replace a principal.
    async fn upsert(&self, principal: Principal) -> CoreResult<()>;

    /// Remove a principal, returning it if present.
    async fn remove(&self, id: PrincipalId) -> CoreResult<Option<Principal>>;

    /// List every principal in the store.
    async fn list(&self) -> CoreResult<Vec<Principal>>;
}

/// In-memory principal store for testing and simple deployments.
#[derive(Debug, Default)]
pub struct InMemoryPrincipalStore {
    principals: std::sync::RwLock<HashMap<PrincipalId, Principal>>,
}

impl InMemoryPrincipalStore {
    /// Create a new in-memory principal store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap in an Arc for sharing.
    #[must_use]
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait::async_trait]
impl PrincipalStore for InMemoryPrincipalStore {
    async fn get(&self, id: PrincipalId) -> CoreResult<Option<Principal>> {
        let principals = self
            .principals
            .read()
            .map_err(|e| CoreError::Store(format!("failed to read principals: {e}")))?;
        Ok(principals.get(&id).cloned())
    }

    async fn get_by_username(&self, username: &str) -> CoreResult<Option<Principal>> {
        let principals = self
            .principals
            .read()
            .map_err(|e| CoreError::Store(format!("failed to read principals: {e}")))?;
        Ok(principals.values().find(|p| p.username == username).cloned())
    }

    async fn upsert(&self, principal: Principal) -> CoreResult<()> {
        let mut principals = self
            .principals
            .write()
            .map_err(|e| CoreError::Store(format!("failed to write principals: {e}")))?;
        principals.insert(principal.id, principal);
        Ok(())
    }

    async fn remove(&self, id: PrincipalId) -> CoreResult<Option<Principal>> {
        let mut principals = self
            .principals
            .write()
            .map_err(|e| CoreError::Store(format!("failed to write principals: {e}")))?;
        Ok(principals.remove(&id))
    }

    async fn list(&self) -> CoreResult<Vec<Principal>> {
        let principals = self
            .principals
            .read()
            .map_err(|e| CoreError::Store(format!("failed to read principals: {e}")))?;
        Ok(principals.values().cloned().collect())
    }
}
