//! # mirror-sync
//!
//! Command-line host for mirror-sync: mirrors provider items (pull requests,
//! issues, ...) into a local JSON store.
//!
//! ## Commands
//!
//! - `sync`: Reconcile every configured source, or one with `--provider`
//! - `status`: Show mirrored entries, credentials and settings per provider
//! - `login`: Authorize a provider through its OAuth consent screen
//! - `logout`: Forget (and revoke) a provider's credentials
//!
//! ## Example
//!
//! ```bash
//! # Authorize GitHub (prints the consent URL, then paste the redirect back)
//! mirror-sync login github
//!
//! # Mirror every configured source
//! mirror-sync sync
//!
//! # Mirror one source with debug logging
//! mirror-sync -v sync --provider github
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod flow;
mod sources;
mod storage;

use commands::{login, logout, status, sync};

/// Mirror remote provider items into a local store.
#[derive(Parser, Debug)]
#[command(name = "mirror-sync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory for the mirror, credentials and default config
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Configuration file (default: <data-dir>/config.toml)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile configured sources with the local mirror
    Sync {
        /// Only sync this provider
        #[arg(long, short)]
        provider: Option<String>,
    },

    /// Show sync status
    Status,

    /// Authorize a provider
    Login {
        /// Provider id, as configured under [providers.<id>]
        provider: String,
    },

    /// Forget a provider's credentials
    Logout {
        /// Provider id
        provider: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Determine data directory
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };

    // Ensure data directory exists
    tokio::fs::create_dir_all(&data_dir)
        .await
        .context("Failed to create data directory")?;
    config::set_dir_permissions_0700(&data_dir).await?;

    // An explicit config must exist; the default one is optional
    let config_path = match cli.config {
        Some(path) if !path.exists() => {
            anyhow::bail!("Config file {} not found", path.display())
        }
        Some(path) => path,
        None => data_dir.join(config::CONFIG_FILE),
    };
    let config = config::CliConfig::load(&config_path).await?;

    match cli.command {
        Commands::Sync { provider } => {
            sync::run(&data_dir, &config, provider.as_deref()).await?;
        }
        Commands::Status => {
            status::run(&data_dir, &config).await?;
        }
        Commands::Login { provider } => {
            login::run(&data_dir, &config, &provider).await?;
        }
        Commands::Logout { provider } => {
            logout::run(&data_dir, &config, &provider).await?;
        }
    }

    Ok(())
}

/// Install the stderr log subscriber.
fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Get the default data directory for mirror-sync.
fn default_data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("io", "mirror-sync", "mirror-sync")
        .context("Could not determine home directory")?;
    Ok(dirs.data_dir().to_path_buf())
}
