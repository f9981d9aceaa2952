//! Provider credentials: OAuth configuration, tokens and per-provider auth state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{ProviderId, Timestamp};

/// Per-provider OAuth 2.0 configuration.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// Authorization endpoint shown to the user.
    pub auth_url: String,
    /// Token endpoint for code exchange and refresh.
    pub token_url: String,
    /// Registered client id.
    pub client_id: String,
    /// Client secret, for confidential clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Redirect URI registered with the provider.
    pub redirect_uri: String,
    /// Requested scopes.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Token revocation endpoint (RFC 7009), if the provider has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoke_url: Option<String>,
}

// Opaque debug to avoid logging the client secret
impl fmt::Debug for OAuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthConfig")
            .field("auth_url", &self.auth_url)
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .field("revoke_url", &self.revoke_url)
            .finish()
    }
}

/// Tokens issued by a provider. Zeroed on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct AuthTokens {
    /// Bearer credential sent with API calls.
    pub access_token: String,
    /// Long-lived credential used to obtain new access tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// When the access token stops being accepted.
    #[zeroize(skip)]
    pub expires_at: Timestamp,
    /// Token type, normally `Bearer`.
    pub token_type: String,
    /// Scopes actually granted, when the provider reports them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
}

impl AuthTokens {
    /// True if the access token expires within `margin` of `now`.
    pub fn expires_within(&self, margin: Duration, now: Timestamp) -> bool {
        now.saturating_add(margin) >= self.expires_at
    }

    /// True once the access token has expired.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

// Opaque debug to avoid logging credentials
impl fmt::Debug for AuthTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthTokens")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .field("token_type", &self.token_type)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Authentication state for one provider.
///
/// Created by a successful authorization, mutated by refreshes, destroyed on
/// revoke. `tokens.expires_at` never decreases across refreshes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthState {
    /// Provider these credentials belong to.
    pub provider_id: ProviderId,
    /// Whether the provider is currently considered signed in.
    pub authenticated: bool,
    /// Current tokens.
    pub tokens: AuthTokens,
    /// When the interactive authorization completed.
    pub last_auth: Timestamp,
    /// When the tokens were last refreshed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh: Option<Timestamp>,
}
