//! Test doubles for the consumed interfaces.
//!
//! Each mock is cheap to clone; clones share state, so a test can hand one
//! clone to the service under test and keep another to script and inspect it.

use async_trait::async_trait;
use reqwest::Url;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use sync_types::{Item, OAuthConfig, RemoteError};

use crate::auth::{
    query_param, AuthorizationFlow, EndpointError, FlowError, TokenEndpoint, TokenResponse,
};
use crate::source::RemoteItemSource;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
enum FlowBehavior {
    Cancel,
    Deny,
    Error { error: String, description: String },
    ForgeState,
    Network(String),
}

/// Scripted [`AuthorizationFlow`].
///
/// Approves by default: redirects back to the configured `redirect_uri` with
/// a fresh code and the state it was given.
#[derive(Debug, Default, Clone)]
pub struct MockAuthorizationFlow {
    inner: Arc<Mutex<MockFlowInner>>,
}

#[derive(Debug, Default)]
struct MockFlowInner {
    launched: Vec<String>,
    script: VecDeque<FlowBehavior>,
}

impl MockAuthorizationFlow {
    /// Create a flow that approves every request.
    pub fn new() -> Self {
        Self::default()
    }

    /// The next launch is dismissed by the user.
    pub fn cancel_next(&self) {
        lock(&self.inner).script.push_back(FlowBehavior::Cancel);
    }

    /// The next launch redirects with `error=access_denied`.
    pub fn deny_next(&self) {
        lock(&self.inner).script.push_back(FlowBehavior::Deny);
    }

    /// The next launch redirects with an OAuth error.
    pub fn error_next(&self, error: &str, description: &str) {
        lock(&self.inner).script.push_back(FlowBehavior::Error {
            error: error.to_string(),
            description: description.to_string(),
        });
    }

    /// The next launch redirects with a state that does not match.
    pub fn forge_state_next(&self) {
        lock(&self.inner).script.push_back(FlowBehavior::ForgeState);
    }

    /// The next launch fails to reach the consent screen.
    pub fn fail_next_network(&self, error: &str) {
        lock(&self.inner)
            .script
            .push_back(FlowBehavior::Network(error.to_string()));
    }

    /// Number of launches so far.
    pub fn launch_count(&self) -> usize {
        lock(&self.inner).launched.len()
    }

    /// The last authorization URL launched.
    pub fn last_url(&self) -> Option<String> {
        lock(&self.inner).launched.last().cloned()
    }
}

fn redirect(redirect_uri: &str, params: &[(&str, &str)]) -> Result<String, FlowError> {
    Url::parse_with_params(redirect_uri, params)
        .map(String::from)
        .map_err(|e| FlowError::Other(e.to_string()))
}

#[async_trait]
impl AuthorizationFlow for MockAuthorizationFlow {
    async fn launch(&self, authorization_url: &str) -> Result<String, FlowError> {
        let (count, behavior) = {
            let mut inner = lock(&self.inner);
            inner.launched.push(authorization_url.to_string());
            (inner.launched.len(), inner.script.pop_front())
        };

        let redirect_uri = query_param(authorization_url, "redirect_uri")
            .ok_or_else(|| FlowError::Other("authorization URL has no redirect_uri".into()))?;
        let state = query_param(authorization_url, "state").unwrap_or_default();
        let code = format!("code-{}", count);

        match behavior {
            None => redirect(&redirect_uri, &[("code", code.as_str()), ("state", state.as_str())]),
            Some(FlowBehavior::Cancel) => Err(FlowError::Cancelled),
            Some(FlowBehavior::Network(e)) => Err(FlowError::Network(e)),
            Some(FlowBehavior::Deny) => {
                redirect(&redirect_uri, &[("error", "access_denied"), ("state", state.as_str())])
            }
            Some(FlowBehavior::Error { error, description }) => redirect(
                &redirect_uri,
                &[
                    ("error", error.as_str()),
                    ("error_description", description.as_str()),
                    ("state", state.as_str()),
                ],
            ),
            Some(FlowBehavior::ForgeState) => {
                redirect(&redirect_uri, &[("code", code.as_str()), ("state", "forged")])
            }
        }
    }
}

/// Scripted [`TokenEndpoint`].
///
/// Code exchange `n` issues `access-n` / `refresh-n`; refresh `n` issues
/// `refreshed-n` and, unless rotation is disabled, `refresh-rn`.
#[derive(Debug, Clone)]
pub struct MockTokenEndpoint {
    inner: Arc<Mutex<MockEndpointInner>>,
}

#[derive(Debug)]
struct MockEndpointInner {
    exchanges: usize,
    refreshes: usize,
    verifiers: Vec<String>,
    revoked: Vec<String>,
    exchange_expires_in: u64,
    refresh_expires_in: u64,
    rotate_refresh_tokens: bool,
    refresh_delay: Duration,
    fail_next_exchange: Option<EndpointError>,
    fail_next_refresh: Option<EndpointError>,
    fail_next_revoke: Option<EndpointError>,
}

impl Default for MockTokenEndpoint {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockEndpointInner {
                exchanges: 0,
                refreshes: 0,
                verifiers: Vec::new(),
                revoked: Vec::new(),
                exchange_expires_in: 3600,
                refresh_expires_in: 3600,
                rotate_refresh_tokens: true,
                refresh_delay: Duration::ZERO,
                fail_next_exchange: None,
                fail_next_refresh: None,
                fail_next_revoke: None,
            })),
        }
    }
}

impl MockTokenEndpoint {
    /// Create an endpoint issuing one-hour tokens.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lifetime of tokens issued by code exchange.
    pub fn set_exchange_expires_in(&self, secs: u64) {
        lock(&self.inner).exchange_expires_in = secs;
    }

    /// Lifetime of tokens issued by refresh.
    pub fn set_refresh_expires_in(&self, secs: u64) {
        lock(&self.inner).refresh_expires_in = secs;
    }

    /// Whether refreshes return a new refresh token.
    pub fn set_rotate_refresh_tokens(&self, rotate: bool) {
        lock(&self.inner).rotate_refresh_tokens = rotate;
    }

    /// Make every refresh take `delay`.
    pub fn set_refresh_delay(&self, delay: Duration) {
        lock(&self.inner).refresh_delay = delay;
    }

    /// Cause the next code exchange to fail.
    pub fn fail_next_exchange(&self, error: EndpointError) {
        lock(&self.inner).fail_next_exchange = Some(error);
    }

    /// Cause the next refresh to fail.
    pub fn fail_next_refresh(&self, error: EndpointError) {
        lock(&self.inner).fail_next_refresh = Some(error);
    }

    /// Cause the next revocation to fail.
    pub fn fail_next_revoke(&self, error: EndpointError) {
        lock(&self.inner).fail_next_revoke = Some(error);
    }

    /// Code exchanges so far, failed ones included.
    pub fn exchange_count(&self) -> usize {
        lock(&self.inner).exchanges
    }

    /// Refreshes so far, failed ones included.
    pub fn refresh_count(&self) -> usize {
        lock(&self.inner).refreshes
    }

    /// Revocations so far.
    pub fn revoke_count(&self) -> usize {
        lock(&self.inner).revoked.len()
    }

    /// PKCE verifier sent with the last code exchange.
    pub fn last_verifier(&self) -> Option<String> {
        lock(&self.inner).verifiers.last().cloned()
    }
}

#[async_trait]
impl TokenEndpoint for MockTokenEndpoint {
    async fn exchange_code(
        &self,
        _config: &OAuthConfig,
        _code: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse, EndpointError> {
        let mut inner = lock(&self.inner);
        inner.exchanges += 1;
        inner.verifiers.push(code_verifier.to_string());
        if let Some(error) = inner.fail_next_exchange.take() {
            return Err(error);
        }
        let n = inner.exchanges;
        let refresh_token = format!("refresh-{}", n);
        Ok(TokenResponse::bearer(
            format!("access-{}", n),
            Some(refresh_token.as_str()),
            inner.exchange_expires_in,
        ))
    }

    async fn refresh(
        &self,
        _config: &OAuthConfig,
        _refresh_token: &str,
    ) -> Result<TokenResponse, EndpointError> {
        let (n, delay, failure, rotate, expires_in) = {
            let mut inner = lock(&self.inner);
            inner.refreshes += 1;
            (
                inner.refreshes,
                inner.refresh_delay,
                inner.fail_next_refresh.take(),
                inner.rotate_refresh_tokens,
                inner.refresh_expires_in,
            )
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = failure {
            return Err(error);
        }

        let rotated = rotate.then(|| format!("refresh-r{}", n));
        Ok(TokenResponse::bearer(
            format!("refreshed-{}", n),
            rotated.as_deref(),
            expires_in,
        ))
    }

    async fn revoke(&self, _config: &OAuthConfig, token: &str) -> Result<(), EndpointError> {
        let mut inner = lock(&self.inner);
        if let Some(error) = inner.fail_next_revoke.take() {
            return Err(error);
        }
        inner.revoked.push(token.to_string());
        Ok(())
    }
}

/// Scripted [`RemoteItemSource`].
#[derive(Debug, Default, Clone)]
pub struct MockItemSource {
    inner: Arc<Mutex<MockSourceInner>>,
}

#[derive(Debug, Default)]
struct MockSourceInner {
    items: Vec<Item>,
    failures: VecDeque<RemoteError>,
    tokens_seen: Vec<Option<String>>,
}

impl MockItemSource {
    /// Create a source reporting no items.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a source reporting `items`.
    pub fn with_items(items: Vec<Item>) -> Self {
        let source = Self::new();
        source.set_items(items);
        source
    }

    /// Replace the reported items.
    pub fn set_items(&self, items: Vec<Item>) {
        lock(&self.inner).items = items;
    }

    /// Cause the next fetch to fail with `error`.
    pub fn fail_next(&self, error: RemoteError) {
        self.fail_times(1, error);
    }

    /// Cause the next `n` fetches to fail with `error`.
    pub fn fail_times(&self, n: usize, error: RemoteError) {
        let mut inner = lock(&self.inner);
        for _ in 0..n {
            inner.failures.push_back(error.clone());
        }
    }

    /// Number of fetches so far, failed ones included.
    pub fn fetch_count(&self) -> usize {
        lock(&self.inner).tokens_seen.len()
    }

    /// The token passed to each fetch, in order.
    pub fn tokens_seen(&self) -> Vec<Option<String>> {
        lock(&self.inner).tokens_seen.clone()
    }
}

#[async_trait]
impl RemoteItemSource for MockItemSource {
    async fn fetch_items(&self, token: Option<&str>) -> Result<Vec<Item>, RemoteError> {
        let mut inner = lock(&self.inner);
        inner.tokens_seen.push(token.map(String::from));
        match inner.failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(inner.items.clone()),
        }
    }
}
