//! Forget a provider's credentials.

use anyhow::{Context, Result};
use std::path::Path;
use sync_types::ProviderId;

use super::Host;
use crate::config::CliConfig;

/// Run the logout command.
///
/// Revokes upstream when the provider has a revocation endpoint. Succeeds
/// when nothing was saved.
pub async fn run(data_dir: &Path, config: &CliConfig, provider: &str) -> Result<()> {
    let provider = ProviderId::from(provider);
    let host = Host::open(data_dir, config)?;
    let tokens = &host.services().tokens;

    let was_signed_in = tokens.is_authenticated(&provider).await;
    tokens
        .revoke_auth(&provider)
        .await
        .with_context(|| format!("Failed to sign out of '{}'", provider))?;

    if was_signed_in {
        println!("Signed out of {}", provider);
    } else {
        println!("Not signed in to {}", provider);
    }
    Ok(())
}
