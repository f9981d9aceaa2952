//! Authorize a provider.

use anyhow::{bail, Result};
use std::path::Path;
use sync_types::{AuthError, ProviderId, Timestamp};

use super::{require_oauth, Host};
use crate::config::CliConfig;

/// Run the login command.
pub async fn run(data_dir: &Path, config: &CliConfig, provider: &str) -> Result<()> {
    let provider = ProviderId::from(provider);
    require_oauth(config, &provider)?;

    let host = Host::open(data_dir, config)?;
    let state = match host.services().tokens.authenticate(&provider).await {
        Ok(state) => state,
        Err(AuthError::UserCancelled) => bail!("Login to '{}' cancelled", provider),
        Err(e) => bail!("Login to '{}' failed: {}", provider, e),
    };

    let lifetime = Timestamp::now().until(state.tokens.expires_at);
    println!(
        "Signed in to {} (token valid for {} min)",
        provider,
        lifetime.as_secs() / 60
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn provider_without_oauth_is_rejected() {
        let dir = tempdir().unwrap();
        let config = CliConfig::parse(
            "[sources.github]\nkind = \"http\"\nurl = \"https://api.test/items\"\n",
            Path::new("/"),
        )
        .unwrap();

        let err = run(dir.path(), &config, "github").await.unwrap_err();

        assert!(err.to_string().contains("no OAuth settings"));
    }
}
