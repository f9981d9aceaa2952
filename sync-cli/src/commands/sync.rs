//! Reconcile configured sources with the local mirror.

use anyhow::{bail, Result};
use std::path::Path;
use sync_client::SyncResult;
use sync_types::ProviderId;

use super::Host;
use crate::config::CliConfig;

/// Run the sync command.
pub async fn run(data_dir: &Path, config: &CliConfig, provider: Option<&str>) -> Result<()> {
    if config.sources.is_empty() {
        println!("No sources configured. Add [sources.<provider>] to the config.");
        return Ok(());
    }

    let host = Host::open(data_dir, config)?;
    let engine = host.engine();

    let results = match provider {
        Some(id) => {
            let id = ProviderId::from(id);
            if config.source(&id).is_none() {
                bail!("No source configured for provider '{}'", id);
            }
            vec![engine.sync_provider(&id).await]
        }
        None => engine.sync_all().await,
    };

    for result in &results {
        print_result(result);
    }

    let pending = host.services().resolver.pending();
    if !pending.is_empty() {
        println!();
        println!("{} conflict(s) await a manual decision:", pending.len());
        for conflict in &pending {
            println!("  {}", conflict.id);
        }
    }

    let failed = results.iter().filter(|r| !r.is_success()).count();
    if failed > 0 {
        bail!("{} of {} provider(s) did not sync cleanly", failed, results.len());
    }
    Ok(())
}

fn print_result(result: &SyncResult) {
    match &result.error {
        Some(error) => println!("{}: FAILED: {}", result.provider_id, error),
        None => {
            println!(
                "{}: +{} ~{} -{} ({}ms)",
                result.provider_id,
                result.added,
                result.updated,
                result.deleted,
                result.duration.as_millis()
            );
            for error in &result.errors {
                println!("  ! {}", error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::JsonStore;
    use sync_client::LocalStore;
    use tempfile::tempdir;

    fn config_with_feed(feed: &Path) -> CliConfig {
        CliConfig::parse(
            &format!(
                "[sources.github]\nkind = \"file\"\npath = {:?}\n",
                feed.display().to_string()
            ),
            Path::new("/"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn mirrors_feed_into_store() {
        let dir = tempdir().unwrap();
        let feed = dir.path().join("feed.json");
        std::fs::write(
            &feed,
            r#"[{"url": "https://x/1", "title": "one"}, {"url": "https://x/2", "title": "two"}]"#,
        )
        .unwrap();
        let config = config_with_feed(&feed);

        run(dir.path(), &config, None).await.unwrap();

        let entries = JsonStore::new(dir.path())
            .list_items(&ProviderId::from("github"))
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn second_run_applies_changes_only() {
        let dir = tempdir().unwrap();
        let feed = dir.path().join("feed.json");
        std::fs::write(&feed, r#"[{"url": "https://x/1", "title": "one"}]"#).unwrap();
        let config = config_with_feed(&feed);
        run(dir.path(), &config, None).await.unwrap();

        std::fs::write(&feed, r#"[{"url": "https://x/1", "title": "uno"}]"#).unwrap();
        run(dir.path(), &config, Some("github")).await.unwrap();

        let entries = JsonStore::new(dir.path())
            .list_items(&ProviderId::from("github"))
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title, "uno");
    }

    #[tokio::test]
    async fn unknown_provider_is_an_error() {
        let dir = tempdir().unwrap();
        let config = config_with_feed(&dir.path().join("feed.json"));

        let result = run(dir.path(), &config, Some("gitlab")).await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unreadable_feed_fails_the_command() {
        let dir = tempdir().unwrap();
        let config = config_with_feed(&dir.path().join("absent.json"));

        let result = run(dir.path(), &config, None).await;

        assert!(result.is_err());
        assert!(!dir.path().join(crate::storage::MIRROR_FILE).exists());
    }
}
