//! Interactive authorization: the host-provided consent flow, plus the
//! authorization URL and redirect handling around it.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use reqwest::Url;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use sync_types::{AuthError, OAuthConfig};
use thiserror::Error;
use zeroize::Zeroizing;

/// Failures of the interactive flow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    /// The user closed or dismissed the consent screen.
    #[error("authorization cancelled")]
    Cancelled,

    /// The consent screen could not be reached.
    #[error("network error: {0}")]
    Network(String),

    /// Anything else.
    #[error("authorization flow failed: {0}")]
    Other(String),
}

impl From<FlowError> for AuthError {
    fn from(e: FlowError) -> Self {
        match e {
            FlowError::Cancelled => AuthError::UserCancelled,
            FlowError::Network(msg) => AuthError::NetworkError(msg),
            FlowError::Other(msg) => AuthError::Unknown(msg),
        }
    }
}

/// Shows the authorization URL to the user and returns the redirect URL the
/// provider sent back.
#[async_trait]
pub trait AuthorizationFlow: Send + Sync {
    /// Run the consent flow for `authorization_url`.
    async fn launch(&self, authorization_url: &str) -> Result<String, FlowError>;
}

/// Bytes of entropy in the CSRF state and the PKCE verifier.
const RANDOM_BYTES: usize = 32;

/// URL-safe random string from the OS RNG.
pub(crate) fn random_token() -> Result<Zeroizing<String>, AuthError> {
    let mut bytes = Zeroizing::new([0u8; RANDOM_BYTES]);
    getrandom::getrandom(&mut bytes[..])
        .map_err(|e| AuthError::Unknown(format!("system RNG unavailable: {}", e)))?;
    Ok(Zeroizing::new(URL_SAFE_NO_PAD.encode(&bytes[..])))
}

/// PKCE S256 challenge for `verifier`.
pub(crate) fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Build the provider's authorization URL.
pub(crate) fn authorization_url(
    config: &OAuthConfig,
    state: &str,
    challenge: &str,
) -> Result<String, AuthError> {
    let scope = config.scopes.join(" ");
    let mut params = vec![
        ("response_type", "code"),
        ("client_id", config.client_id.as_str()),
        ("redirect_uri", config.redirect_uri.as_str()),
        ("state", state),
        ("code_challenge", challenge),
        ("code_challenge_method", "S256"),
    ];
    if !scope.is_empty() {
        params.push(("scope", scope.as_str()));
    }

    Url::parse_with_params(&config.auth_url, &params)
        .map(String::from)
        .map_err(|e| AuthError::InvalidConfig(format!("invalid auth_url: {}", e)))
}

/// Extract the authorization code from the provider's redirect.
///
/// `error=access_denied` means the user declined. Any other `error` is a
/// rejection of the client or request.
pub(crate) fn parse_redirect(redirect: &str, expected_state: &str) -> Result<String, AuthError> {
    let url = Url::parse(redirect)
        .map_err(|e| AuthError::InvalidCredentials(format!("malformed redirect: {}", e)))?;
    let params: HashMap<String, String> = url.query_pairs().into_owned().collect();

    if let Some(error) = params.get("error") {
        if error == "access_denied" {
            return Err(AuthError::UserCancelled);
        }
        let reason = params
            .get("error_description")
            .cloned()
            .unwrap_or_else(|| error.clone());
        return Err(AuthError::InvalidCredentials(reason));
    }

    match params.get("state") {
        Some(state) if state == expected_state => {}
        _ => {
            return Err(AuthError::InvalidCredentials(
                "state mismatch in redirect".into(),
            ))
        }
    }

    params
        .get("code")
        .filter(|code| !code.is_empty())
        .cloned()
        .ok_or_else(|| AuthError::InvalidCredentials("redirect carried no code".into()))
}

/// Read one query parameter of a URL.
pub(crate) fn query_param(url: &str, name: &str) -> Option<String> {
    Url::parse(url)
        .ok()?
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}
