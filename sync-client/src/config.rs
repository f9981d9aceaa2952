//! Configuration loading for mirror-sync services.
//!
//! Configuration is loaded from a TOML file. Every field has a default, so a
//! partial (or empty) file is valid.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sync_core::{
    BackoffStrategy, ConflictStrategy, QuotaConfig, RateLimitStrategy, RetryPolicy,
};
use sync_types::{OAuthConfig, ProviderId};

use crate::auth::{AuthStore, AuthorizationFlow, TokenEndpoint, TokenManager};
use crate::engine::{ProviderOptions, Services};
use crate::limiter::{spawn_sweep_task, RateLimiter};
use crate::resolver::ConflictResolver;
use crate::retry::RetryEngine;

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Engine-wide settings.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Default retry policy for remote fetches.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Rate limiter housekeeping.
    #[serde(default)]
    pub limiter: LimiterConfig,
    /// Token lifecycle settings.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Per-provider settings, keyed by provider id.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

/// Engine-wide settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    /// Conflict strategy for providers without an override (default: remote-wins).
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
}

/// Retry policy settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds (default: 1000).
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound on any delay in milliseconds (default: 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor for exponential backoff (default: 2.0).
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Backoff shape (default: exponential).
    #[serde(default)]
    pub strategy: BackoffStrategy,
    /// Randomize delays by ±25% (default: true).
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

/// Per-provider retry override. Unset fields inherit from `[retry]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryOverride {
    /// Retries after the first attempt.
    pub max_retries: Option<u32>,
    /// Delay before the first retry in milliseconds.
    pub initial_delay_ms: Option<u64>,
    /// Upper bound on any delay in milliseconds.
    pub max_delay_ms: Option<u64>,
    /// Growth factor for exponential backoff.
    pub backoff_multiplier: Option<f64>,
    /// Backoff shape.
    pub strategy: Option<BackoffStrategy>,
    /// Randomize delays.
    pub jitter: Option<bool>,
}

/// Rate limiter housekeeping.
#[derive(Debug, Clone, Deserialize)]
pub struct LimiterConfig {
    /// Sweep interval in seconds (default: 60).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Drop quota state idle for this many seconds (default: 300).
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,
}

/// Token lifecycle settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Refresh tokens this many seconds before expiry (default: 300).
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: u64,
}

/// Settings for one provider.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderConfig {
    /// Conflict strategy override.
    #[serde(default)]
    pub conflict_strategy: Option<ConflictStrategy>,
    /// Rate limit. Unlimited if absent.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    /// OAuth client settings. No credentials are used if absent.
    #[serde(default)]
    pub oauth: Option<OAuthConfig>,
    /// Retry override.
    #[serde(default)]
    pub retry: Option<RetryOverride>,
    /// Refuse to fetch without a token (default: true when `oauth` is set).
    #[serde(default)]
    pub requires_auth: Option<bool>,
}

/// Per-provider rate limit.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Algorithm (default: token-bucket).
    #[serde(default)]
    pub strategy: RateLimitStrategy,
    /// Requests allowed per window.
    pub max_requests: u32,
    /// Window length in milliseconds.
    pub window_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_idle_ttl() -> u64 {
    300
}

fn default_refresh_margin() -> u64 {
    300
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            strategy: BackoffStrategy::default(),
            jitter: default_jitter(),
        }
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            idle_ttl_secs: default_idle_ttl(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_margin_secs: default_refresh_margin(),
        }
    }
}

impl RetryConfig {
    /// The policy these settings describe.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_retries(self.max_retries)
            .with_initial_delay(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_multiplier(self.backoff_multiplier)
            .with_strategy(self.strategy)
            .with_jitter(self.jitter)
    }
}

impl RetryOverride {
    /// `base` with the fields set here replaced.
    pub fn apply(&self, base: &RetryPolicy) -> RetryPolicy {
        let mut policy = base.clone();
        if let Some(n) = self.max_retries {
            policy = policy.with_max_retries(n);
        }
        if let Some(ms) = self.initial_delay_ms {
            policy = policy.with_initial_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = self.max_delay_ms {
            policy = policy.with_max_delay(Duration::from_millis(ms));
        }
        if let Some(m) = self.backoff_multiplier {
            policy = policy.with_multiplier(m);
        }
        if let Some(s) = self.strategy {
            policy = policy.with_strategy(s);
        }
        if let Some(j) = self.jitter {
            policy = policy.with_jitter(j);
        }
        policy
    }
}

impl RateLimitConfig {
    /// The quota these settings describe.
    pub fn quota(&self) -> QuotaConfig {
        QuotaConfig::new(
            self.strategy,
            self.max_requests,
            Duration::from_millis(self.window_ms),
        )
    }
}

impl ProviderConfig {
    /// Engine options for this provider, given the global retry policy.
    pub fn options(&self, default_retry: &RetryPolicy) -> ProviderOptions {
        ProviderOptions {
            retry: self.retry.as_ref().map(|o| o.apply(default_retry)),
            requires_auth: self.requires_auth.unwrap_or(self.oauth.is_some()),
        }
    }
}

fn check_retry(scope: &str, policy: &RetryPolicy) -> Result<(), ConfigError> {
    if policy.backoff_multiplier.is_nan() || policy.backoff_multiplier < 1.0 {
        return Err(ConfigError::Invalid(format!(
            "{}: backoff_multiplier must be at least 1.0",
            scope
        )));
    }
    if policy.initial_delay > policy.max_delay {
        return Err(ConfigError::Invalid(format!(
            "{}: initial_delay_ms exceeds max_delay_ms",
            scope
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or describes
    /// an unusable setting.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings that parse but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let default_retry = self.retry.policy();
        check_retry("[retry]", &default_retry)?;

        for (id, provider) in &self.providers {
            if id.trim().is_empty() {
                return Err(ConfigError::Invalid("empty provider id".into()));
            }
            if let Some(limit) = &provider.rate_limit {
                limit
                    .quota()
                    .validate()
                    .map_err(|e| ConfigError::Invalid(format!("providers.{}: {}", id, e)))?;
            }
            if let Some(retry) = &provider.retry {
                check_retry(&format!("providers.{}.retry", id), &retry.apply(&default_retry))?;
            }
        }
        Ok(())
    }

    /// Ids of the configured providers.
    pub fn provider_ids(&self) -> Vec<ProviderId> {
        self.providers.keys().map(ProviderId::new).collect()
    }

    /// Settings for one provider, if configured.
    pub fn provider(&self, provider: &ProviderId) -> Option<&ProviderConfig> {
        self.providers.get(provider.as_str())
    }

    /// Refresh margin as a duration.
    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.auth.refresh_margin_secs)
    }
}

impl Services {
    /// Build the services described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider's rate limit is unusable.
    pub fn from_config(
        config: &Config,
        flow: Arc<dyn AuthorizationFlow>,
        endpoint: Arc<dyn TokenEndpoint>,
        auth_store: Arc<dyn AuthStore>,
    ) -> Result<Self, ConfigError> {
        let tokens =
            TokenManager::with_refresh_margin(flow, endpoint, auth_store, config.refresh_margin());
        let limiter = RateLimiter::new();
        let resolver = ConflictResolver::new(config.engine.conflict_strategy);

        for (id, provider) in &config.providers {
            let id = ProviderId::new(id.as_str());
            if let Some(oauth) = &provider.oauth {
                tokens.register_config(id.clone(), oauth.clone());
            }
            if let Some(limit) = &provider.rate_limit {
                limiter
                    .configure(id.clone(), limit.quota())
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            }
            if let Some(strategy) = provider.conflict_strategy {
                resolver.set_strategy(id, strategy);
            }
        }

        Ok(Self {
            tokens,
            limiter,
            retry: RetryEngine::new(config.retry.policy()),
            resolver: Arc::new(resolver),
        })
    }

    /// Start the background rate-limit sweep described by `config`.
    pub fn spawn_sweep(&self, config: &LimiterConfig) -> tokio::task::JoinHandle<()> {
        spawn_sweep_task(
            self.limiter.clone(),
            Duration::from_secs(config.sweep_interval_secs),
            Duration::from_secs(config.idle_ttl_secs),
        )
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A setting parsed but is unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryAuthStore;
    use crate::mock::{MockAuthorizationFlow, MockTokenEndpoint};
    use std::io::Write;

    const FULL: &str = r#"
[engine]
conflict_strategy = "newest-wins"

[retry]
max_retries = 5
initial_delay_ms = 100
strategy = "linear"
jitter = false

[limiter]
sweep_interval_secs = 30

[auth]
refresh_margin_secs = 120

[providers.github]
conflict_strategy = "manual"

[providers.github.rate_limit]
strategy = "fixed-window"
max_requests = 2
window_ms = 1000

[providers.github.oauth]
auth_url = "https://github.test/login/oauth/authorize"
token_url = "https://github.test/login/oauth/access_token"
client_id = "abc"
redirect_uri = "http://127.0.0.1:8765/callback"
scopes = ["repo"]

[providers.github.retry]
max_retries = 1

[providers.feed]
"#;

    fn services(config: &Config) -> Result<Services, ConfigError> {
        Services::from_config(
            config,
            Arc::new(MockAuthorizationFlow::new()),
            Arc::new(MockTokenEndpoint::new()),
            Arc::new(MemoryAuthStore::new()),
        )
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.engine.conflict_strategy, ConflictStrategy::RemoteWins);
        assert_eq!(config.retry.policy(), RetryPolicy::default());
        assert_eq!(config.limiter.sweep_interval_secs, 60);
        assert_eq!(config.limiter.idle_ttl_secs, 300);
        assert_eq!(config.refresh_margin(), Duration::from_secs(300));
        assert!(config.providers.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn full_config_parses() {
        let config: Config = toml::from_str(FULL).unwrap();

        assert_eq!(config.engine.conflict_strategy, ConflictStrategy::NewestWins);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert_eq!(config.retry.strategy, BackoffStrategy::Linear);
        assert_eq!(config.limiter.idle_ttl_secs, 300);
        assert_eq!(
            config.provider_ids(),
            vec![ProviderId::from("feed"), ProviderId::from("github")]
        );

        let github = config.provider(&ProviderId::from("github")).unwrap();
        assert_eq!(github.conflict_strategy, Some(ConflictStrategy::Manual));
        let limit = github.rate_limit.as_ref().unwrap().quota();
        assert_eq!(limit.strategy, RateLimitStrategy::FixedWindow);
        assert_eq!(limit.window, Duration::from_secs(1));
        assert_eq!(github.oauth.as_ref().unwrap().client_secret, None);
    }

    #[test]
    fn provider_options_inherit_and_override() {
        let config: Config = toml::from_str(FULL).unwrap();
        let default_retry = config.retry.policy();

        let github = config
            .provider(&ProviderId::from("github"))
            .unwrap()
            .options(&default_retry);
        let retry = github.retry.unwrap();
        assert_eq!(retry.max_retries, 1);
        assert_eq!(retry.initial_delay, Duration::from_millis(100));
        assert!(github.requires_auth);

        let feed = config
            .provider(&ProviderId::from("feed"))
            .unwrap()
            .options(&default_retry);
        assert!(feed.retry.is_none());
        assert!(!feed.requires_auth);
    }

    #[tokio::test]
    async fn services_reflect_config() {
        let config: Config = toml::from_str(FULL).unwrap();

        let services = services(&config).unwrap();
        let github = ProviderId::from("github");

        assert_eq!(services.retry.default_policy().max_retries, 5);
        assert_eq!(
            services.resolver.strategy_for(&github),
            ConflictStrategy::Manual
        );
        assert_eq!(
            services.resolver.strategy_for(&ProviderId::from("feed")),
            ConflictStrategy::NewestWins
        );
        assert!(services.limiter.check_limit(&github));
        assert!(services.limiter.check_limit(&github));
        assert!(!services.limiter.check_limit(&github));
    }

    #[test]
    fn zero_rate_limit_is_invalid() {
        let config: Config = toml::from_str(
            r#"
[providers.github.rate_limit]
max_requests = 0
window_ms = 1000
"#,
        )
        .unwrap();

        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert!(services(&config).is_err());
    }

    #[test]
    fn inverted_delays_are_invalid() {
        let config: Config = toml::from_str(
            r#"
[retry]
initial_delay_ms = 5000
max_delay_ms = 100
"#,
        )
        .unwrap();

        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unknown_strategy_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[engine]\nconflict_strategy = \"coin-flip\"\n").unwrap();

        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();

        assert!(matches!(
            Config::from_file(&dir.path().join("absent.toml")),
            Err(ConfigError::ReadError { .. })
        ));
    }

    #[test]
    fn from_file_loads_and_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();

        assert_eq!(config.providers.len(), 2);
    }
}
