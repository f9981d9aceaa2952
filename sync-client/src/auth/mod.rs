//! Token lifecycle management.
//!
//! [`TokenManager`] owns every provider's [`AuthState`]: it runs the
//! interactive authorization (with CSRF state and PKCE), hands out access
//! tokens, refreshes them ahead of expiry and revokes them.
//!
//! # Refresh discipline
//!
//! - `get_token` never returns a token expiring within the refresh margin
//!   (5 minutes by default) without first attempting a refresh.
//! - Each provider has at most one pending refresh timer. Scheduling a new
//!   one aborts the old one.
//! - Refreshes for one provider are serialized by a per-provider async lock
//!   and re-check the tokens once they hold it, so concurrent callers never
//!   trigger two refreshes at once.
//! - `expires_at` never moves backwards across refreshes.
//! - A failed refresh leaves the current tokens untouched and emits
//!   [`AuthEvent::AuthFailure`].

mod endpoint;
mod flow;
mod store;

pub use endpoint::{
    EndpointError, HttpTokenEndpoint, TokenEndpoint, TokenResponse, DEFAULT_EXPIRES_IN,
};
pub use flow::{AuthorizationFlow, FlowError};
pub use store::{AuthStore, MemoryAuthStore};

pub(crate) use flow::query_param;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use sync_types::{AuthError, AuthState, AuthTokens, OAuthConfig, ProviderId, Timestamp};
use tokio::task::JoinHandle;

use crate::events::{EventBus, ScopedEvent};

/// Refresh this long before the access token expires.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Authentication lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// Interactive authorization completed.
    AuthSuccess {
        /// Provider.
        provider_id: ProviderId,
    },
    /// Authorization or refresh failed.
    AuthFailure {
        /// Provider.
        provider_id: ProviderId,
        /// Why.
        error: AuthError,
    },
    /// Tokens were refreshed.
    TokenRefresh {
        /// Provider.
        provider_id: ProviderId,
        /// New expiry.
        expires_at: Timestamp,
    },
    /// Credentials were revoked and forgotten.
    AuthRevoked {
        /// Provider.
        provider_id: ProviderId,
    },
}

impl ScopedEvent for AuthEvent {
    fn provider_id(&self) -> &ProviderId {
        match self {
            Self::AuthSuccess { provider_id }
            | Self::AuthFailure { provider_id, .. }
            | Self::TokenRefresh { provider_id, .. }
            | Self::AuthRevoked { provider_id } => provider_id,
        }
    }
}

/// Provider-specific refresh, used instead of the refresh-token grant.
#[async_trait]
pub trait RefreshHandler: Send + Sync {
    /// Produce new tokens from the current ones.
    async fn refresh(
        &self,
        provider: &ProviderId,
        current: &AuthTokens,
    ) -> Result<AuthTokens, AuthError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshMode {
    /// Always refresh.
    Force,
    /// Refresh unless the tokens are outside the margin.
    IfNeeded,
    /// Refresh unless the tokens changed since the timer was armed.
    IfUnchanged(Timestamp),
}

struct RefreshTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

struct ManagerInner {
    configs: RwLock<HashMap<ProviderId, OAuthConfig>>,
    handlers: RwLock<HashMap<ProviderId, Arc<dyn RefreshHandler>>>,
    states: DashMap<ProviderId, AuthState>,
    // Providers whose persisted state has already been looked up
    loaded: DashSet<ProviderId>,
    timers: Mutex<HashMap<ProviderId, RefreshTimer>>,
    refresh_locks: DashMap<ProviderId, Arc<tokio::sync::Mutex<()>>>,
    next_generation: AtomicU64,
    flow: Arc<dyn AuthorizationFlow>,
    endpoint: Arc<dyn TokenEndpoint>,
    store: Arc<dyn AuthStore>,
    events: EventBus<AuthEvent>,
    refresh_margin: Duration,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let timers = self.timers.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, timer) in timers.drain() {
            timer.handle.abort();
        }
    }
}

/// Owner of all provider credentials. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("authenticated", &self.inner.states.len())
            .field("refresh_margin", &self.inner.refresh_margin)
            .finish()
    }
}

impl TokenManager {
    /// Create a manager with the default refresh margin.
    pub fn new(
        flow: Arc<dyn AuthorizationFlow>,
        endpoint: Arc<dyn TokenEndpoint>,
        store: Arc<dyn AuthStore>,
    ) -> Self {
        Self::with_refresh_margin(flow, endpoint, store, DEFAULT_REFRESH_MARGIN)
    }

    /// Create a manager that refreshes `refresh_margin` before expiry.
    pub fn with_refresh_margin(
        flow: Arc<dyn AuthorizationFlow>,
        endpoint: Arc<dyn TokenEndpoint>,
        store: Arc<dyn AuthStore>,
        refresh_margin: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                configs: RwLock::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                states: DashMap::new(),
                loaded: DashSet::new(),
                timers: Mutex::new(HashMap::new()),
                refresh_locks: DashMap::new(),
                next_generation: AtomicU64::new(1),
                flow,
                endpoint,
                store,
                events: EventBus::new(),
                refresh_margin,
            }),
        }
    }

    /// Authentication events.
    pub fn events(&self) -> &EventBus<AuthEvent> {
        &self.inner.events
    }

    /// Set a provider's OAuth configuration. Last write wins.
    pub fn register_config(&self, provider: ProviderId, config: OAuthConfig) {
        self.inner
            .configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(provider, config);
    }

    /// Use `handler` instead of the refresh-token grant for `provider`.
    pub fn register_refresh_handler(&self, provider: ProviderId, handler: Arc<dyn RefreshHandler>) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(provider, handler);
    }

    fn config(&self, provider: &ProviderId) -> Option<OAuthConfig> {
        self.inner
            .configs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider)
            .cloned()
    }

    fn handler(&self, provider: &ProviderId) -> Option<Arc<dyn RefreshHandler>> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider)
            .cloned()
    }

    fn refresh_lock(&self, provider: &ProviderId) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .refresh_locks
            .entry(provider.clone())
            .or_default()
            .clone()
    }

    /// Run the interactive authorization for `provider` and store the result.
    #[tracing::instrument(skip(self), fields(provider = %provider))]
    pub async fn authenticate(&self, provider: &ProviderId) -> Result<AuthState, AuthError> {
        match self.authorize(provider).await {
            Ok(tokens) => {
                let state = AuthState {
                    provider_id: provider.clone(),
                    authenticated: true,
                    tokens,
                    last_auth: Timestamp::now(),
                    last_refresh: None,
                };
                self.install(state.clone()).await;
                tracing::info!("Authenticated with {}", provider);
                self.inner.events.emit(&AuthEvent::AuthSuccess {
                    provider_id: provider.clone(),
                });
                Ok(state)
            }
            Err(error) => {
                tracing::warn!("Authentication with {} failed: {}", provider, error);
                self.inner.events.emit(&AuthEvent::AuthFailure {
                    provider_id: provider.clone(),
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    async fn authorize(&self, provider: &ProviderId) -> Result<AuthTokens, AuthError> {
        let config = self
            .config(provider)
            .ok_or_else(|| AuthError::InvalidConfig(format!("no OAuth config for {}", provider)))?;
        for (field, value) in [
            ("auth_url", &config.auth_url),
            ("token_url", &config.token_url),
            ("client_id", &config.client_id),
            ("redirect_uri", &config.redirect_uri),
        ] {
            if value.trim().is_empty() {
                return Err(AuthError::InvalidConfig(format!("{} is empty", field)));
            }
        }

        let csrf_state = flow::random_token()?;
        let verifier = flow::random_token()?;
        let url = flow::authorization_url(&config, &csrf_state, &flow::pkce_challenge(&verifier))?;

        tracing::debug!("Launching authorization for {}", provider);
        let redirect = self.inner.flow.launch(&url).await?;
        let code = flow::parse_redirect(&redirect, &csrf_state)?;

        let response = self
            .inner
            .endpoint
            .exchange_code(&config, &code, &verifier)
            .await?;
        Ok(response.to_tokens(Timestamp::now(), None))
    }

    /// Persist, cache and arm the refresh timer for a new or refreshed state.
    async fn install(&self, state: AuthState) {
        if let Err(e) = self.inner.store.save(&state).await {
            tracing::warn!("Failed to persist credentials for {}: {}", state.provider_id, e);
        }
        let provider = state.provider_id.clone();
        let expires_at = state.tokens.expires_at;
        self.inner.loaded.insert(provider.clone());
        self.inner.states.insert(provider.clone(), state);
        self.schedule_refresh(&provider, expires_at);
    }

    /// Load persisted state the first time a provider is touched.
    async fn ensure_loaded(&self, provider: &ProviderId) {
        if self.inner.states.contains_key(provider) || self.inner.loaded.contains(provider) {
            return;
        }

        match self.inner.store.load(provider).await {
            Ok(Some(state)) => {
                self.inner.loaded.insert(provider.clone());
                if !self.inner.states.contains_key(provider) {
                    let expires_at = state.tokens.expires_at;
                    self.inner.states.insert(provider.clone(), state);
                    self.schedule_refresh(provider, expires_at);
                    tracing::debug!("Restored credentials for {}", provider);
                }
            }
            Ok(None) => {
                self.inner.loaded.insert(provider.clone());
            }
            // Not marked loaded: the next call tries again
            Err(e) => tracing::warn!("Failed to load credentials for {}: {}", provider, e),
        }
    }

    fn current_tokens(&self, provider: &ProviderId) -> Option<AuthTokens> {
        self.inner.states.get(provider).map(|s| s.tokens.clone())
    }

    /// A usable access token, refreshing first if it expires within the margin.
    ///
    /// `Ok(None)` if the provider has no credentials.
    pub async fn get_token(&self, provider: &ProviderId) -> Result<Option<String>, AuthError> {
        self.ensure_loaded(provider).await;
        let Some(tokens) = self.current_tokens(provider) else {
            return Ok(None);
        };

        if !tokens.expires_within(self.inner.refresh_margin, Timestamp::now()) {
            return Ok(Some(tokens.access_token.clone()));
        }

        tracing::debug!("Token for {} expires soon, refreshing", provider);
        let refreshed = self.refresh_with(provider, RefreshMode::IfNeeded).await?;
        Ok(Some(refreshed.access_token.clone()))
    }

    /// Refresh unconditionally, then return the new access token.
    ///
    /// Used after the provider rejected the current token. `Ok(None)` if the
    /// provider has no credentials.
    pub async fn get_fresh_token(
        &self,
        provider: &ProviderId,
    ) -> Result<Option<String>, AuthError> {
        self.ensure_loaded(provider).await;
        if !self.inner.states.contains_key(provider) {
            return Ok(None);
        }
        let refreshed = self.refresh_with(provider, RefreshMode::Force).await?;
        Ok(Some(refreshed.access_token.clone()))
    }

    /// Refresh the provider's tokens now.
    pub async fn refresh_token(&self, provider: &ProviderId) -> Result<AuthTokens, AuthError> {
        self.ensure_loaded(provider).await;
        self.refresh_with(provider, RefreshMode::Force).await
    }

    async fn refresh_with(
        &self,
        provider: &ProviderId,
        mode: RefreshMode,
    ) -> Result<AuthTokens, AuthError> {
        let lock = self.refresh_lock(provider);
        let _guard = lock.lock().await;

        let Some(state) = self.inner.states.get(provider).map(|s| s.clone()) else {
            return Err(AuthError::RefreshFailed(format!("not authenticated with {}", provider)));
        };

        match mode {
            RefreshMode::Force => {}
            RefreshMode::IfNeeded => {
                if !state
                    .tokens
                    .expires_within(self.inner.refresh_margin, Timestamp::now())
                {
                    return Ok(state.tokens);
                }
            }
            RefreshMode::IfUnchanged(armed_for) => {
                if state.tokens.expires_at != armed_for {
                    return Ok(state.tokens);
                }
            }
        }

        match self.perform_refresh(provider, &state.tokens).await {
            Ok(mut tokens) => {
                tokens.expires_at = tokens.expires_at.max(state.tokens.expires_at);
                if tokens.refresh_token.is_none() {
                    tokens.refresh_token = state.tokens.refresh_token.clone();
                }
                let expires_at = tokens.expires_at;
                self.install(AuthState {
                    provider_id: state.provider_id.clone(),
                    authenticated: true,
                    tokens: tokens.clone(),
                    last_auth: state.last_auth,
                    last_refresh: Some(Timestamp::now()),
                })
                .await;

                tracing::debug!("Refreshed token for {}", provider);
                self.inner.events.emit(&AuthEvent::TokenRefresh {
                    provider_id: provider.clone(),
                    expires_at,
                });
                Ok(tokens)
            }
            Err(error) => {
                let error = match error {
                    AuthError::RefreshFailed(_) => error,
                    other => AuthError::RefreshFailed(other.to_string()),
                };
                tracing::warn!("Token refresh for {} failed: {}", provider, error);
                self.inner.events.emit(&AuthEvent::AuthFailure {
                    provider_id: provider.clone(),
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    async fn perform_refresh(
        &self,
        provider: &ProviderId,
        current: &AuthTokens,
    ) -> Result<AuthTokens, AuthError> {
        if let Some(handler) = self.handler(provider) {
            return handler.refresh(provider, current).await;
        }

        let config = self
            .config(provider)
            .ok_or_else(|| AuthError::InvalidConfig(format!("no OAuth config for {}", provider)))?;
        let refresh_token = current
            .refresh_token
            .as_deref()
            .ok_or_else(|| AuthError::RefreshFailed("no refresh token".into()))?;

        let response = self.inner.endpoint.refresh(&config, refresh_token).await?;
        Ok(response.to_tokens(Timestamp::now(), Some(refresh_token)))
    }

    /// Arm the single refresh timer for `provider`, replacing any pending one.
    fn schedule_refresh(&self, provider: &ProviderId, expires_at: Timestamp) {
        let fire_at = expires_at.saturating_sub(self.inner.refresh_margin);
        let delay = Timestamp::now().until(fire_at);
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let task_provider = provider.clone();

        let mut timers = self
            .inner
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let manager = TokenManager { inner };
            manager.clear_timer(&task_provider, generation);
            if let Err(e) = manager
                .refresh_with(&task_provider, RefreshMode::IfUnchanged(expires_at))
                .await
            {
                tracing::debug!("Scheduled refresh for {} failed: {}", task_provider, e);
            }
        });

        let timer = RefreshTimer { generation, handle };
        if let Some(previous) = timers.insert(provider.clone(), timer) {
            previous.handle.abort();
        }
        tracing::debug!(
            "Refresh for {} scheduled in {}s",
            provider,
            delay.as_secs()
        );
    }

    fn clear_timer(&self, provider: &ProviderId, generation: u64) {
        let mut timers = self
            .inner
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if timers.get(provider).map(|t| t.generation) == Some(generation) {
            timers.remove(provider);
        }
    }

    fn cancel_timer(&self, provider: &ProviderId) {
        let removed = self
            .inner
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(provider);
        if let Some(timer) = removed {
            timer.handle.abort();
        }
    }

    /// Number of providers with a pending refresh timer.
    pub fn pending_refreshes(&self) -> usize {
        self.inner
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|t| !t.handle.is_finished())
            .count()
    }

    /// Forget a provider's credentials, locally and (best effort) upstream.
    #[tracing::instrument(skip(self), fields(provider = %provider))]
    pub async fn revoke_auth(&self, provider: &ProviderId) -> Result<(), AuthError> {
        let lock = self.refresh_lock(provider);
        let _guard = lock.lock().await;

        self.cancel_timer(provider);
        self.ensure_loaded(provider).await;
        let state = self.inner.states.remove(provider).map(|(_, s)| s);
        self.inner.loaded.insert(provider.clone());

        if let (Some(state), Some(config)) = (state.as_ref(), self.config(provider)) {
            if config.revoke_url.is_some() {
                let token = state
                    .tokens
                    .refresh_token
                    .as_deref()
                    .unwrap_or(&state.tokens.access_token);
                if let Err(e) = self.inner.endpoint.revoke(&config, token).await {
                    tracing::warn!("Remote revocation for {} failed: {}", provider, e);
                }
            }
        }

        self.inner
            .store
            .remove(provider)
            .await
            .map_err(|e| AuthError::Unknown(format!("failed to clear credentials: {}", e)))?;

        tracing::info!("Revoked credentials for {}", provider);
        self.inner.events.emit(&AuthEvent::AuthRevoked {
            provider_id: provider.clone(),
        });
        Ok(())
    }

    /// True if the provider has credentials that are usable or refreshable.
    pub async fn is_authenticated(&self, provider: &ProviderId) -> bool {
        self.ensure_loaded(provider).await;
        self.inner
            .states
            .get(provider)
            .map(|s| {
                s.authenticated
                    && (s.tokens.refresh_token.is_some() || !s.tokens.is_expired(Timestamp::now()))
            })
            .unwrap_or(false)
    }

    /// Current in-memory state for a provider.
    pub fn auth_state(&self, provider: &ProviderId) -> Option<AuthState> {
        self.inner.states.get(provider).map(|s| s.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockAuthorizationFlow, MockTokenEndpoint};
    use futures_util::future::join_all;

    fn github() -> ProviderId {
        ProviderId::from("github")
    }

    fn oauth_config() -> OAuthConfig {
        OAuthConfig {
            auth_url: "https://provider.test/authorize".into(),
            token_url: "https://provider.test/token".into(),
            client_id: "client-1".into(),
            client_secret: Some("s3cret".into()),
            redirect_uri: "https://app.test/callback".into(),
            scopes: vec!["repo".into()],
            revoke_url: Some("https://provider.test/revoke".into()),
        }
    }

    struct Fixture {
        manager: TokenManager,
        flow: MockAuthorizationFlow,
        endpoint: MockTokenEndpoint,
        store: MemoryAuthStore,
    }

    fn fixture() -> Fixture {
        let flow = MockAuthorizationFlow::new();
        let endpoint = MockTokenEndpoint::new();
        let store = MemoryAuthStore::new();
        let manager = TokenManager::new(
            Arc::new(flow.clone()),
            Arc::new(endpoint.clone()),
            Arc::new(store.clone()),
        );
        manager.register_config(github(), oauth_config());
        Fixture {
            manager,
            flow,
            endpoint,
            store,
        }
    }

    fn record_events(manager: &TokenManager) -> Arc<Mutex<Vec<AuthEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        manager.events().subscribe(github(), move |e: &AuthEvent| {
            sink.lock().unwrap().push(e.clone());
        });
        events
    }

    #[tokio::test]
    async fn authenticate_exchanges_code_and_persists() {
        let f = fixture();
        let events = record_events(&f.manager);

        let state = f.manager.authenticate(&github()).await.unwrap();

        assert!(state.authenticated);
        assert_eq!(f.endpoint.exchange_count(), 1);
        assert!(f.store.get(&github()).is_some());
        assert!(f.manager.is_authenticated(&github()).await);
        assert_eq!(f.manager.pending_refreshes(), 1);
        assert_eq!(
            events.lock().unwrap().as_slice(),
            &[AuthEvent::AuthSuccess {
                provider_id: github()
            }]
        );
    }

    #[tokio::test]
    async fn authenticate_sends_pkce_and_state() {
        let f = fixture();

        f.manager.authenticate(&github()).await.unwrap();

        let url = f.flow.last_url().unwrap();
        assert!(query_param(&url, "state").is_some());
        let challenge = query_param(&url, "code_challenge").unwrap();
        let verifier = f.endpoint.last_verifier().unwrap();
        assert_eq!(flow::pkce_challenge(&verifier), challenge);
    }

    #[tokio::test]
    async fn missing_config_is_invalid_config() {
        let f = fixture();

        let err = f
            .manager
            .authenticate(&ProviderId::from("unknown"))
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::InvalidConfig(_)));
        assert_eq!(f.flow.launch_count(), 0);
    }

    #[tokio::test]
    async fn user_cancel_is_distinguishable() {
        let f = fixture();
        let events = record_events(&f.manager);
        f.flow.cancel_next();

        let err = f.manager.authenticate(&github()).await.unwrap_err();

        assert_eq!(err, AuthError::UserCancelled);
        assert!(!f.manager.is_authenticated(&github()).await);
        assert!(matches!(
            events.lock().unwrap().as_slice(),
            [AuthEvent::AuthFailure { .. }]
        ));
    }

    #[tokio::test]
    async fn denied_consent_is_user_cancelled() {
        let f = fixture();
        f.flow.deny_next();

        assert_eq!(
            f.manager.authenticate(&github()).await.unwrap_err(),
            AuthError::UserCancelled
        );
    }

    #[tokio::test]
    async fn forged_state_is_rejected() {
        let f = fixture();
        f.flow.forge_state_next();

        let err = f.manager.authenticate(&github()).await.unwrap_err();

        assert!(matches!(err, AuthError::InvalidCredentials(_)));
        assert_eq!(f.endpoint.exchange_count(), 0);
    }

    #[tokio::test]
    async fn rejected_code_is_invalid_credentials() {
        let f = fixture();
        f.endpoint.fail_next_exchange(EndpointError::Rejected {
            status: 400,
            error: "invalid_grant".into(),
            description: None,
        });

        assert_eq!(
            f.manager.authenticate(&github()).await.unwrap_err(),
            AuthError::InvalidCredentials("invalid_grant".into())
        );
    }

    #[tokio::test]
    async fn fresh_token_returned_without_refresh() {
        let f = fixture();
        f.manager.authenticate(&github()).await.unwrap();

        let token = f.manager.get_token(&github()).await.unwrap();

        assert_eq!(token.as_deref(), Some("access-1"));
        assert_eq!(f.endpoint.refresh_count(), 0);
    }

    #[tokio::test]
    async fn unauthenticated_provider_has_no_token() {
        let f = fixture();
        assert_eq!(f.manager.get_token(&github()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn token_within_margin_is_refreshed_first() {
        let f = fixture();
        // Expires in 2 minutes, inside the 5 minute margin
        f.endpoint.set_exchange_expires_in(120);
        f.manager.authenticate(&github()).await.unwrap();

        let token = f.manager.get_token(&github()).await.unwrap().unwrap();

        assert_ne!(token, "access-1");
        assert_eq!(f.endpoint.refresh_count(), 1);
        let state = f.manager.auth_state(&github()).unwrap();
        assert!(!state
            .tokens
            .expires_within(DEFAULT_REFRESH_MARGIN, Timestamp::now()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_get_token_refreshes_once() {
        let f = fixture();
        f.endpoint.set_exchange_expires_in(60);
        f.endpoint.set_refresh_delay(Duration::from_millis(50));
        f.manager.authenticate(&github()).await.unwrap();

        let provider = github();
        let calls = (0..10).map(|_| f.manager.get_token(&provider));
        let tokens = join_all(calls).await;

        assert_eq!(f.endpoint.refresh_count(), 1);
        let first = tokens[0].as_ref().unwrap().clone();
        for t in &tokens {
            assert_eq!(t.as_ref().unwrap(), &first);
        }
    }

    #[tokio::test]
    async fn failed_refresh_keeps_tokens_and_emits_failure() {
        let f = fixture();
        f.manager.authenticate(&github()).await.unwrap();
        let before = f.manager.auth_state(&github()).unwrap().tokens;
        let events = record_events(&f.manager);
        f.endpoint.fail_next_refresh(EndpointError::Network("offline".into()));

        let err = f.manager.refresh_token(&github()).await.unwrap_err();

        assert!(matches!(err, AuthError::RefreshFailed(_)));
        assert_eq!(f.manager.auth_state(&github()).unwrap().tokens, before);
        assert!(matches!(
            events.lock().unwrap().as_slice(),
            [AuthEvent::AuthFailure { .. }]
        ));
    }

    #[tokio::test]
    async fn refresh_never_moves_expiry_backwards() {
        let f = fixture();
        f.endpoint.set_exchange_expires_in(7200);
        f.manager.authenticate(&github()).await.unwrap();
        let before = f.manager.auth_state(&github()).unwrap().tokens.expires_at;
        f.endpoint.set_refresh_expires_in(600);

        let tokens = f.manager.refresh_token(&github()).await.unwrap();

        assert!(tokens.expires_at >= before);
        assert_eq!(f.manager.pending_refreshes(), 1);
    }

    #[tokio::test]
    async fn refresh_keeps_refresh_token_when_not_rotated() {
        let f = fixture();
        f.manager.authenticate(&github()).await.unwrap();
        f.endpoint.set_rotate_refresh_tokens(false);

        let tokens = f.manager.refresh_token(&github()).await.unwrap();

        assert_eq!(tokens.refresh_token.as_deref(), Some("refresh-1"));
    }

    struct StaticRefresh;

    #[async_trait]
    impl RefreshHandler for StaticRefresh {
        async fn refresh(
            &self,
            _provider: &ProviderId,
            current: &AuthTokens,
        ) -> Result<AuthTokens, AuthError> {
            let mut tokens = current.clone();
            tokens.access_token = "custom".into();
            tokens.expires_at = Timestamp::now().saturating_add(Duration::from_secs(3600));
            Ok(tokens)
        }
    }

    #[tokio::test]
    async fn custom_refresh_handler_is_preferred() {
        let f = fixture();
        f.manager.authenticate(&github()).await.unwrap();
        f.manager
            .register_refresh_handler(github(), Arc::new(StaticRefresh));

        let tokens = f.manager.refresh_token(&github()).await.unwrap();

        assert_eq!(tokens.access_token, "custom");
        assert_eq!(f.endpoint.refresh_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_refreshes_before_expiry() {
        let f = fixture();
        // Margin is 5 minutes: the timer fires after 10 seconds
        f.endpoint.set_exchange_expires_in(310);
        let events = record_events(&f.manager);
        f.manager.authenticate(&github()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(f.endpoint.refresh_count(), 1);
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, AuthEvent::TokenRefresh { .. })));
        assert_eq!(f.manager.pending_refreshes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reauthentication_replaces_timer() {
        let f = fixture();
        f.manager.authenticate(&github()).await.unwrap();
        f.manager.authenticate(&github()).await.unwrap();

        assert_eq!(f.manager.pending_refreshes(), 1);
    }

    #[tokio::test]
    async fn revoke_clears_state_timer_and_store() {
        let f = fixture();
        f.manager.authenticate(&github()).await.unwrap();
        let events = record_events(&f.manager);

        f.manager.revoke_auth(&github()).await.unwrap();

        assert!(!f.manager.is_authenticated(&github()).await);
        assert!(f.store.get(&github()).is_none());
        assert_eq!(f.manager.pending_refreshes(), 0);
        assert_eq!(f.endpoint.revoke_count(), 1);
        assert_eq!(f.manager.get_token(&github()).await.unwrap(), None);
        assert_eq!(
            events.lock().unwrap().as_slice(),
            &[AuthEvent::AuthRevoked {
                provider_id: github()
            }]
        );
    }

    #[tokio::test]
    async fn remote_revoke_failure_still_clears_local_state() {
        let f = fixture();
        f.manager.authenticate(&github()).await.unwrap();
        f.endpoint.fail_next_revoke(EndpointError::Network("offline".into()));

        f.manager.revoke_auth(&github()).await.unwrap();

        assert!(f.manager.auth_state(&github()).is_none());
    }

    #[tokio::test]
    async fn persisted_state_is_restored_lazily() {
        let f = fixture();
        f.manager.authenticate(&github()).await.unwrap();
        let saved = f.store.get(&github()).unwrap();

        // A fresh manager over the same store, as after a restart
        let restarted = TokenManager::new(
            Arc::new(f.flow.clone()),
            Arc::new(f.endpoint.clone()),
            Arc::new(f.store.clone()),
        );
        restarted.register_config(github(), oauth_config());

        assert!(restarted.auth_state(&github()).is_none());
        let token = restarted.get_token(&github()).await.unwrap();

        assert_eq!(token.as_deref(), Some(saved.tokens.access_token.as_str()));
        assert_eq!(restarted.pending_refreshes(), 1);
        assert_eq!(f.flow.launch_count(), 1);
    }

    #[tokio::test]
    async fn listener_panic_does_not_break_authentication() {
        let f = fixture();
        f.manager
            .events()
            .subscribe_all(|_: &AuthEvent| panic!("listener bug"));

        assert!(f.manager.authenticate(&github()).await.is_ok());
    }
}
