use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use imagesync::error::SyncError;
use imagesync::reference::canonical_identity_for_digest;
use imagesync::settings::Settings;
use imagesync::sync::{DriftDetector, SyncEngine, SyncRecord, UpdateOutcome};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "Mirror container images between OCI registries", long_about = None)]
pub struct Cli {
    /// Config file (TOML or YAML). Defaults to $IMAGESYNC_CONFIG, then the user config dir
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Copy a source image to a destination tag
    Create {
        /// Source reference (e.g., gcr.io/org/app@sha256:...)
        #[arg(long)]
        source: String,
        /// Destination reference, must carry a tag
        #[arg(long)]
        destination: String,
    },
    /// Resolve the canonical identity of a destination
    Read {
        #[arg(long)]
        destination: String,
    },
    /// Check whether a source still resolves to a known digest
    Drift {
        #[arg(long)]
        source: String,
        #[arg(long)]
        last_digest: String,
    },
    /// Point an existing destination at a new source
    Update {
        /// New source reference
        #[arg(long)]
        source: String,
        #[arg(long)]
        destination: String,
        /// Digest the destination was last synced from
        #[arg(long)]
        last_digest: String,
        /// Last known canonical identity of the destination
        #[arg(long, default_value = "")]
        id: String,
        /// Delete and recreate the destination if the source drifted
        #[arg(long)]
        replace: bool,
    },
    /// Delete a destination tag and purge its manifest if unreferenced
    Delete {
        #[arg(long)]
        destination: String,
        /// Last known canonical identity of the destination
        #[arg(long, default_value = "")]
        id: String,
    },
    /// Compute the canonical identity of a reference without contacting a registry
    Identity {
        #[arg(long)]
        reference: String,
        #[arg(long)]
        digest: String,
    },
}

#[derive(Serialize)]
struct ReadOutput {
    id: Option<String>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", out);
    Ok(())
}

/// Config file lookup: `--config`, `$IMAGESYNC_CONFIG`, then `<config dir>/imagesync/config.{toml,yaml,yml}`
fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    Settings::resolve_path(explicit).or_else(|| {
        let dir = dirs::config_dir()?.join("imagesync");
        ["config.toml", "config.yaml", "config.yml"]
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    })
}

/// Engine for the commands that talk to a registry
fn engine(config: Option<&Path>) -> Result<SyncEngine> {
    let settings =
        Settings::load(config_path(config).as_deref()).context("Failed to load settings")?;
    imagesync::engine_from_settings(&settings)
}

async fn run(cli: Cli, cancel: CancellationToken) -> Result<()> {
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Identity { reference, digest } => {
            println!("{}", canonical_identity_for_digest(&reference, &digest)?);
        }
        Commands::Create {
            source,
            destination,
        } => {
            let record = engine(config)?
                .create(&source, &destination, &cancel)
                .await?;
            print_json(&record)?;
        }
        Commands::Read { destination } => {
            let id = engine(config)?.read(&destination, &cancel).await?;
            if id.is_none() {
                info!("Destination {} is absent", destination);
            }
            print_json(&ReadOutput { id })?;
        }
        Commands::Drift {
            source,
            last_digest,
        } => {
            let engine = engine(config)?;
            let report = DriftDetector::new(engine.gateway())
                .has_drifted(&source, &last_digest, &engine.call_guard(&cancel))
                .await?;
            print_json(&report)?;
        }
        Commands::Update {
            source,
            destination,
            last_digest,
            id,
            replace,
        } => {
            let engine = engine(config)?;
            let record = SyncRecord {
                source: source.clone(),
                destination,
                source_digest: last_digest,
                id,
                synced_at: Utc::now(),
            };
            match engine.update(&record, &source, &cancel).await? {
                UpdateOutcome::ReplaceRequired { new_digest } if replace => {
                    info!("Source drifted to {}, replacing destination", new_digest);
                    let replaced = engine.replace(&record, &source, &cancel).await?;
                    print_json(&UpdateOutcome::Refreshed { record: replaced })?;
                }
                outcome => print_json(&outcome)?,
            }
        }
        Commands::Delete { destination, id } => {
            let outcome = engine(config)?.delete(&destination, &id, &cancel).await?;
            print_json(&outcome)?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays machine readable
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling in-flight registry calls");
            on_signal.cancel();
        }
    });

    match run(cli, cancel).await {
        Ok(()) => Ok(()),
        Err(e)
            if e
                .downcast_ref::<SyncError>()
                .is_some_and(SyncError::is_partial_cleanup) =>
        {
            warn!("{}", e);
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}
