//! Operator CLI for the Offkit agent.
//!
//! Provides commands for:
//! - Installing a manifest into the on-disk precache store
//! - Listing stored keys and their versions
//! - Showing how a URL would be routed
//! - Rendering the notification a push payload produces
//!
//! ## Usage
//!
//! ```bash
//! # Precache a build and make it the active version
//! offkit-agent --config agent.json install --manifest dist/precache.json --version 2024-06-01
//!
//! # Inspect the store
//! offkit-agent --config agent.json keys
//!
//! # Ask how a deep link is answered
//! offkit-agent --config agent.json classify https://app.example/roadmap/abc123 --navigate \
//!     --manifest dist/precache.json --version 2024-06-01
//!
//! # Preview a push notification
//! offkit-agent push --payload reminder.json
//! ```

use clap::{Parser, Subcommand};
use offkit_common::{init_logging, LogConfig, LogFormat, Result};
use serde::Serialize;
use std::path::PathBuf;
use tracing::error;

mod commands;

#[derive(Parser)]
#[command(name = "offkit-agent")]
#[command(about = "Operator CLI for the Offkit offline agent")]
struct Cli {
    /// Agent config file (JSON); defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "offkit_sw=debug"
    #[arg(long, global = true)]
    log: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Precache a manifest and activate it
    Install {
        /// Manifest file: JSON array of {"url", "revision"}
        #[arg(short, long)]
        manifest: PathBuf,
        /// Version (build id) of the manifest
        #[arg(short, long)]
        version: String,
    },

    /// List stored keys and the active version
    Keys,

    /// Show how a request would be answered
    Classify {
        /// Request URL
        url: String,
        /// Manifest file of the version to route with
        #[arg(short, long)]
        manifest: PathBuf,
        /// Version of the manifest
        #[arg(short, long)]
        version: String,
        /// Request method
        #[arg(long, default_value = "GET")]
        method: String,
        /// Treat the request as a top-level navigation
        #[arg(long)]
        navigate: bool,
    },

    /// Render the notification for a push payload
    Push {
        /// Payload file; an empty push when omitted
        #[arg(short, long)]
        payload: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::default().with_format(if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Compact
    });
    if let Some(filter) = &cli.log {
        log_config = log_config.with_filter(filter.clone());
    }
    init_logging(log_config);

    if let Err(e) = run(cli).await {
        error!(category = e.category(), error = %e, "Command failed");
        return Err(e.into());
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Install { manifest, version } => {
            let manifest = commands::load_manifest(&manifest, &version)?;
            let outcome = commands::install(config, manifest).await?;
            print_json(&outcome)?;
            if !outcome.report.failed.is_empty() {
                std::process::exit(2);
            }
        }

        Commands::Keys => {
            let store = commands::open_store(&config)?;
            print_json(&commands::keys(&store)?)?;
        }

        Commands::Classify {
            url,
            manifest,
            version,
            method,
            navigate,
        } => {
            let manifest = commands::load_manifest(&manifest, &version)?;
            let store = commands::open_store(&config)?;
            let classification =
                commands::classify(&config, &manifest, &store, &url, &method, navigate)?;
            print_json(&classification)?;
        }

        Commands::Push { payload } => {
            let payload = payload.map(std::fs::read).transpose()?;
            print_json(&commands::push(&config, payload).await?)?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(std::io::Error::from)?;
    println!("{json}");
    Ok(())
}
