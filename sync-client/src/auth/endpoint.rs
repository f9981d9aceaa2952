//! OAuth 2.0 token endpoint: code exchange, refresh grant, revocation.

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use sync_types::{AuthError, AuthTokens, OAuthConfig, Timestamp};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Lifetime assumed when the provider omits `expires_in`.
pub const DEFAULT_EXPIRES_IN: Duration = Duration::from_secs(3600);

/// Token endpoint failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    /// The endpoint could not be reached.
    #[error("network error: {0}")]
    Network(String),

    /// The endpoint answered with an OAuth error.
    #[error("token endpoint rejected request (HTTP {status}): {error}")]
    Rejected {
        /// HTTP status.
        status: u16,
        /// OAuth `error` code, e.g. `invalid_grant`.
        error: String,
        /// OAuth `error_description`, if sent.
        description: Option<String>,
    },

    /// The endpoint answered with something that is not a token response.
    #[error("invalid token response: {0}")]
    InvalidResponse(String),
}

impl From<EndpointError> for AuthError {
    fn from(e: EndpointError) -> Self {
        match e {
            EndpointError::Network(msg) => AuthError::NetworkError(msg),
            EndpointError::Rejected {
                status: 400 | 401,
                error,
                description,
            } => AuthError::InvalidCredentials(description.unwrap_or(error)),
            other => AuthError::Unknown(other.to_string()),
        }
    }
}

/// Successful token endpoint response (RFC 6749 §5.1). Zeroed on drop.
#[derive(Clone, PartialEq, Eq, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct TokenResponse {
    /// New access token.
    pub access_token: String,
    /// New refresh token, if rotated or first issued.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Access token lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Token type, normally `Bearer`.
    #[serde(default)]
    pub token_type: Option<String>,
    /// Space-separated granted scopes.
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// A bearer response, mostly for tests and custom endpoints.
    pub fn bearer(
        access_token: impl Into<String>,
        refresh_token: Option<&str>,
        expires_in: u64,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.map(String::from),
            expires_in: Some(expires_in),
            token_type: Some("Bearer".into()),
            scope: None,
        }
    }

    /// Convert to stored tokens issued at `now`.
    ///
    /// Keeps `previous_refresh` when the response does not rotate the
    /// refresh token.
    pub fn to_tokens(&self, now: Timestamp, previous_refresh: Option<&str>) -> AuthTokens {
        let lifetime = self
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_EXPIRES_IN);
        AuthTokens {
            access_token: self.access_token.clone(),
            refresh_token: self
                .refresh_token
                .clone()
                .or_else(|| previous_refresh.map(String::from)),
            expires_at: now.saturating_add(lifetime),
            token_type: self
                .token_type
                .clone()
                .unwrap_or_else(|| "Bearer".to_string()),
            scopes: self
                .scope
                .as_ref()
                .map(|s| s.split_whitespace().map(String::from).collect()),
        }
    }
}

// Opaque debug to avoid logging credentials
impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .finish()
    }
}

/// The provider's token endpoint.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Exchange an authorization code (with its PKCE verifier) for tokens.
    async fn exchange_code(
        &self,
        config: &OAuthConfig,
        code: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse, EndpointError>;

    /// Run the refresh-token grant.
    async fn refresh(
        &self,
        config: &OAuthConfig,
        refresh_token: &str,
    ) -> Result<TokenResponse, EndpointError>;

    /// Revoke a token (RFC 7009). No-op if the provider has no `revoke_url`.
    async fn revoke(&self, config: &OAuthConfig, token: &str) -> Result<(), EndpointError>;
}

#[derive(Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// [`TokenEndpoint`] over HTTPS form posts.
#[derive(Debug, Clone, Default)]
pub struct HttpTokenEndpoint {
    client: reqwest::Client,
}

impl HttpTokenEndpoint {
    /// Create an endpoint with a default HTTP client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an endpoint with a preconfigured HTTP client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn post_form(
        &self,
        url: &str,
        config: &OAuthConfig,
        params: &[(&str, &str)],
    ) -> Result<reqwest::Response, EndpointError> {
        let mut form: Vec<(&str, &str)> = params.to_vec();
        form.push(("client_id", config.client_id.as_str()));
        if let Some(secret) = config.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        let response = self
            .client
            .post(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| EndpointError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let (error, description) = match serde_json::from_str::<OAuthErrorBody>(&body) {
            Ok(parsed) => (parsed.error, parsed.error_description),
            Err(_) => (
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string(),
                None,
            ),
        };
        Err(EndpointError::Rejected {
            status: status.as_u16(),
            error,
            description,
        })
    }

    async fn token_request(
        &self,
        config: &OAuthConfig,
        params: &[(&str, &str)],
    ) -> Result<TokenResponse, EndpointError> {
        self.post_form(&config.token_url, config, params)
            .await?
            .json::<TokenResponse>()
            .await
            .map_err(|e| EndpointError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    #[tracing::instrument(skip_all, fields(token_url = %config.token_url))]
    async fn exchange_code(
        &self,
        config: &OAuthConfig,
        code: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse, EndpointError> {
        self.token_request(
            config,
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", config.redirect_uri.as_str()),
                ("code_verifier", code_verifier),
            ],
        )
        .await
    }

    #[tracing::instrument(skip_all, fields(token_url = %config.token_url))]
    async fn refresh(
        &self,
        config: &OAuthConfig,
        refresh_token: &str,
    ) -> Result<TokenResponse, EndpointError> {
        self.token_request(
            config,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ],
        )
        .await
    }

    async fn revoke(&self, config: &OAuthConfig, token: &str) -> Result<(), EndpointError> {
        let Some(revoke_url) = config.revoke_url.as_deref() else {
            return Ok(());
        };
        self.post_form(revoke_url, config, &[("token", token)])
            .await
            .map(|_| ())
    }
}
