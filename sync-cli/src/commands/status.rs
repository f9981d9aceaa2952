//! Show sync status.

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use sync_client::{LocalStore, RecordStore};
use sync_core::{ConflictStrategy, RateLimitStrategy};
use sync_types::{ProviderId, Timestamp};

use super::Host;
use crate::config::{CliConfig, SourceConfig};

/// Run the status command.
pub async fn run(data_dir: &Path, config: &CliConfig) -> Result<()> {
    println!("=== mirror-sync status ===");
    println!();

    let providers = config.provider_ids();
    if providers.is_empty() {
        println!("No providers configured.");
        println!();
        println!("Add [sources.<provider>] to the config, then run 'mirror-sync sync'.");
        return Ok(());
    }

    let host = Host::open(data_dir, config)?;
    let store = host.engine().store();
    let services = host.services();
    println!("Mirror: {}", store.path().display());

    let now = Timestamp::now();
    for provider in &providers {
        println!();
        println!("{}", provider);

        let source = match config.source(provider) {
            Some(SourceConfig::File { path }) => format!("file {}", path.display()),
            Some(SourceConfig::Http { url }) => format!("http {}", url),
            None => "none".to_string(),
        };
        println!("  Source:     {}", source);

        let entries = store
            .list_items(provider)
            .await
            .with_context(|| format!("Failed to read mirror for {}", provider))?;
        let last_synced = store
            .load_records(provider)
            .await
            .with_context(|| format!("Failed to read sync records for {}", provider))?
            .iter()
            .map(|r| r.last_synced_at)
            .max();
        let synced = match last_synced {
            Some(ts) => format!("last synced {}", format_age(ts.until(now))),
            None => "never synced".to_string(),
        };
        println!("  Entries:    {} ({})", entries.len(), synced);

        println!("  Auth:       {}", auth_line(&host, config, provider, now).await);
        println!(
            "  Conflicts:  {}",
            strategy_name(services.resolver.strategy_for(provider))
        );
        let limit = match services.limiter.config(provider) {
            Some(quota) => format!(
                "{} per {}s ({})",
                quota.max_requests,
                quota.window.as_secs_f64(),
                limiter_name(quota.strategy)
            ),
            None => "unlimited".to_string(),
        };
        println!("  Rate limit: {}", limit);
    }

    Ok(())
}

async fn auth_line(
    host: &Host,
    config: &CliConfig,
    provider: &ProviderId,
    now: Timestamp,
) -> String {
    let has_oauth = config
        .core
        .provider(provider)
        .is_some_and(|p| p.oauth.is_some());
    if !has_oauth {
        return "not required".to_string();
    }

    let tokens = &host.services().tokens;
    if !tokens.is_authenticated(provider).await {
        return format!("not signed in (run 'mirror-sync login {}')", provider);
    }
    match tokens.auth_state(provider) {
        Some(state) if state.tokens.is_expired(now) => "signed in (token expired)".to_string(),
        Some(state) => format!(
            "signed in (token expires in {})",
            format_duration(now.until(state.tokens.expires_at))
        ),
        None => "signed in".to_string(),
    }
}

fn strategy_name(strategy: ConflictStrategy) -> &'static str {
    match strategy {
        ConflictStrategy::RemoteWins => "remote-wins",
        ConflictStrategy::LocalWins => "local-wins",
        ConflictStrategy::NewestWins => "newest-wins",
        ConflictStrategy::Merge => "merge",
        ConflictStrategy::Manual => "manual",
    }
}

fn limiter_name(strategy: RateLimitStrategy) -> &'static str {
    match strategy {
        RateLimitStrategy::TokenBucket => "token-bucket",
        RateLimitStrategy::SlidingWindow => "sliding-window",
        RateLimitStrategy::FixedWindow => "fixed-window",
    }
}

/// Format an elapsed duration as a human-readable age.
fn format_age(elapsed: Duration) -> String {
    if elapsed.as_secs() < 60 {
        "just now".to_string()
    } else {
        format!("{} ago", format_duration(elapsed))
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86400)
    }
}
