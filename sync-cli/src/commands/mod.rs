//! CLI command implementations.

pub mod login;
pub mod logout;
pub mod status;
pub mod sync;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use sync_client::{HttpTokenEndpoint, ProviderOptions, Services, SyncEngine};
use sync_types::ProviderId;

use crate::config::CliConfig;
use crate::flow::ConsoleAuthorizationFlow;
use crate::sources;
use crate::storage::{FileAuthStore, JsonStore};

/// Services and engine wired to the data directory and configured sources.
pub struct Host {
    engine: SyncEngine<JsonStore>,
}

impl Host {
    /// Build the host described by `config`, storing state in `data_dir`.
    pub fn open(data_dir: &Path, config: &CliConfig) -> Result<Self> {
        let services = Services::from_config(
            &config.core,
            Arc::new(ConsoleAuthorizationFlow::stdin()),
            Arc::new(HttpTokenEndpoint::new()),
            Arc::new(FileAuthStore::new(data_dir)),
        )
        .context("Invalid service configuration")?;

        let default_retry = config.core.retry.policy();
        let engine = SyncEngine::new(JsonStore::new(data_dir), services);
        for (id, source) in &config.sources {
            let provider = ProviderId::new(id.as_str());
            let options = config
                .core
                .provider(&provider)
                .map(|p| p.options(&default_retry))
                .unwrap_or_else(ProviderOptions::default);
            let source = sources::build(&provider, source, &engine.services().limiter);
            engine.register_provider_with(provider, source, options);
        }

        Ok(Self { engine })
    }

    /// The reconciliation engine.
    pub fn engine(&self) -> &SyncEngine<JsonStore> {
        &self.engine
    }

    /// The shared services.
    pub fn services(&self) -> &Services {
        self.engine.services()
    }
}

/// Fail unless `provider` has an `[providers.<id>.oauth]` section.
pub(crate) fn require_oauth(config: &CliConfig, provider: &ProviderId) -> Result<()> {
    match config.core.provider(provider) {
        Some(p) if p.oauth.is_some() => Ok(()),
        _ => anyhow::bail!(
            "Provider '{}' has no OAuth settings. Add [providers.{}.oauth] to the config.",
            provider,
            provider
        ),
    }
}
