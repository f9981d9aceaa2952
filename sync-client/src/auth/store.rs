//! Credential persistence.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use sync_types::{AuthState, ProviderId, StoreError};

/// Durable storage for [`AuthState`], one entry per provider.
#[async_trait]
pub trait AuthStore: Send + Sync {
    /// Saved state for a provider, if any.
    async fn load(&self, provider: &ProviderId) -> Result<Option<AuthState>, StoreError>;

    /// Save or replace a provider's state.
    async fn save(&self, state: &AuthState) -> Result<(), StoreError>;

    /// Forget a provider's state. Not an error if none was saved.
    async fn remove(&self, provider: &ProviderId) -> Result<(), StoreError>;
}

/// In-memory [`AuthStore`] for tests and ephemeral hosts.
#[derive(Debug, Default, Clone)]
pub struct MemoryAuthStore {
    inner: Arc<Mutex<MemoryAuthStoreInner>>,
}

#[derive(Debug, Default)]
struct MemoryAuthStoreInner {
    states: HashMap<ProviderId, AuthState>,
    loads: usize,
    fail_next_load: Option<String>,
    fail_next_save: Option<String>,
}

impl MemoryAuthStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryAuthStoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a saved state, as if left by a previous run.
    pub fn seed(&self, state: AuthState) {
        self.lock().states.insert(state.provider_id.clone(), state);
    }

    /// The saved state for a provider.
    pub fn get(&self, provider: &ProviderId) -> Option<AuthState> {
        self.lock().states.get(provider).cloned()
    }

    /// Number of `load` calls so far.
    pub fn load_count(&self) -> usize {
        self.lock().loads
    }

    /// Cause the next `load` to fail.
    pub fn fail_next_load(&self, error: &str) {
        self.lock().fail_next_load = Some(error.to_string());
    }

    /// Cause the next `save` to fail.
    pub fn fail_next_save(&self, error: &str) {
        self.lock().fail_next_save = Some(error.to_string());
    }
}

#[async_trait]
impl AuthStore for MemoryAuthStore {
    async fn load(&self, provider: &ProviderId) -> Result<Option<AuthState>, StoreError> {
        let mut inner = self.lock();
        inner.loads += 1;
        if let Some(error) = inner.fail_next_load.take() {
            return Err(StoreError::Unavailable(error));
        }
        Ok(inner.states.get(provider).cloned())
    }

    async fn save(&self, state: &AuthState) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(error) = inner.fail_next_save.take() {
            return Err(StoreError::Io(error));
        }
        inner
            .states
            .insert(state.provider_id.clone(), state.clone());
        Ok(())
    }

    async fn remove(&self, provider: &ProviderId) -> Result<(), StoreError> {
        self.lock().states.remove(provider);
        Ok(())
    }
}
