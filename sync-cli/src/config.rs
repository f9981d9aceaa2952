//! Configuration and private-file helpers for mirror-sync.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use sync_client::Config;
use sync_types::ProviderId;

/// Config file looked up in the data directory when `--config` is absent.
pub const CONFIG_FILE: &str = "config.toml";

/// Where a provider's items come from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    /// A JSON file holding an array of items.
    File {
        /// Path to the file; relative paths resolve against the config file.
        path: PathBuf,
    },
    /// An HTTP endpoint answering `GET` with a JSON array of items.
    Http {
        /// Feed URL.
        url: String,
    },
}

/// Service settings plus the CLI's item sources.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CliConfig {
    /// Engine, retry, limiter, auth and per-provider settings.
    #[serde(flatten)]
    pub core: Config,
    /// Item source per provider id.
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

impl CliConfig {
    /// Load the configuration at `path`.
    ///
    /// A missing file is an empty configuration.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read config {}", path.display()))
            }
        };
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&contents, base).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Parse TOML, resolving relative source paths against `base`.
    pub fn parse(contents: &str, base: &Path) -> Result<Self> {
        let mut config: Self = toml::from_str(contents)?;
        config.core.validate()?;

        for (id, source) in &mut config.sources {
            if id.trim().is_empty() {
                bail!("empty source id");
            }
            match source {
                SourceConfig::File { path } => {
                    if path.is_relative() {
                        *path = base.join(&*path);
                    }
                }
                SourceConfig::Http { url } => {
                    reqwest::Url::parse(url)
                        .with_context(|| format!("sources.{}: invalid url {:?}", id, url))?;
                }
            }
        }
        Ok(config)
    }

    /// Every provider id named by a source or a provider section.
    pub fn provider_ids(&self) -> Vec<ProviderId> {
        let mut ids: Vec<&String> = self
            .sources
            .keys()
            .chain(self.core.providers.keys())
            .collect();
        ids.sort();
        ids.dedup();
        ids.into_iter().map(ProviderId::new).collect()
    }

    /// Source for a provider, if configured.
    pub fn source(&self, provider: &ProviderId) -> Option<&SourceConfig> {
        self.sources.get(provider.as_str())
    }
}

/// Write `value` as pretty JSON readable only by the owner.
pub async fn write_private_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let contents = serde_json::to_string_pretty(value)?;
    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    set_file_permissions_0600(path).await?;
    Ok(())
}

/// Set file permissions to 0600 (owner read/write only) on Unix.
/// No-op on non-Unix platforms.
async fn set_file_permissions_0600(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .context("Failed to set file permissions")?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Set directory permissions to 0700 (owner only) on Unix.
/// No-op on non-Unix platforms.
pub async fn set_dir_permissions_0700(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .await
            .context("Failed to set directory permissions")?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
