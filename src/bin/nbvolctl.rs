//! Volume management CLI
//!
//! Thin glue over the orchestrator: every subcommand is one lifecycle
//! call. Configuration comes from a TOML file produced by the setup
//! tooling.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use std::path::PathBuf;

use nbvol::align::parse_granularity;
use nbvol::{StorageConfig, VolumeManager};

#[derive(Parser)]
#[command(name = "nbvolctl")]
#[command(about = "Network block-volume management", long_about = None)]
struct Cli {
    /// Path to the storage configuration file
    #[arg(long, default_value = "/etc/nbvol/storage.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Allocate a new volume and attach it
    Allocate {
        /// Owner id the volume belongs to
        owner: String,

        /// Requested size (bytes, or with K/M/G suffix)
        size: String,

        /// Explicit volume name (derived from owner when omitted)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Grow a volume
    Resize {
        /// Volume name
        volume: String,

        /// New size (bytes, or with K/M/G suffix)
        size: String,
    },

    /// Tear down a volume
    Free {
        /// Volume name
        volume: String,
    },

    /// Clone a volume for a new owner
    Clone {
        /// Source volume name
        source: String,

        /// Owner id for the clone
        owner: String,

        /// Explicit name for the clone
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Create a named snapshot
    Snapshot {
        /// Volume name
        volume: String,

        /// Snapshot name
        name: String,

        /// Delete the snapshot instead of creating it
        #[arg(short, long)]
        delete: bool,
    },

    /// List volumes
    List {
        /// Only volumes belonging to this owner
        #[arg(short, long)]
        owner: Option<String>,
    },

    /// Establish sessions to every configured portal
    Activate,
}

fn parse_size(size: &str) -> Result<u64> {
    parse_granularity(size)
        .with_context(|| format!("invalid size: {}", size))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let config = StorageConfig::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {:?}", cli.config))?;
    let manager = VolumeManager::new(config).context("failed to initialize orchestrator")?;

    match &cli.command {
        Commands::Allocate { owner, size, name } => {
            let bytes = parse_size(size)?;
            let volume = manager.allocate(owner, bytes, name.as_deref())?;
            println!(
                "{} ({} bytes) at {}",
                volume.name,
                volume.size,
                volume.device.display()
            );
        }
        Commands::Resize { volume, size } => {
            let bytes = parse_size(size)?;
            let actual = manager.resize(volume, bytes)?;
            println!("{} now {} bytes", volume, actual);
        }
        Commands::Free { volume } => {
            manager.free(volume)?;
            println!("{} freed", volume);
        }
        Commands::Clone {
            source,
            owner,
            name,
        } => {
            let dest = manager.clone_volume(source, owner, name.as_deref())?;
            println!("{} -> {}", source, dest);
        }
        Commands::Snapshot {
            volume,
            name,
            delete,
        } => {
            if *delete {
                manager.snapshot_delete(volume, name)?;
                println!("{}@{} deleted", volume, name);
            } else {
                manager.snapshot_create(volume, name)?;
                println!("{}@{} created", volume, name);
            }
        }
        Commands::List { owner } => {
            for info in manager.list(owner.as_deref())? {
                println!(
                    "{:<24} {:>14} {:<16} {}",
                    info.name,
                    info.size,
                    info.export.as_deref().unwrap_or("-"),
                    info.created.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Commands::Activate => {
            manager.activate()?;
            println!("storage activated");
        }
    }

    Ok(())
}
