//! podwall - per-endpoint access-control chain manager
//!
//! Builds, compacts and tears down iptables chain hierarchies for a fleet
//! of workload endpoints.
//!
//! # Usage
//!
//! ```bash
//! podwall init                       # Build chains for every inventoried endpoint
//! podwall init --seed 42             # Reproducible synthesis
//! podwall optimize                   # Compact every deployed endpoint chain
//! podwall clear                      # Tear the whole hierarchy down
//! podwall --dry-run init             # Full protocol against an in-memory sink
//! ```
//!
//! # Security
//!
//! Mutating the kernel ruleset requires the privileges iptables itself
//! requires; `--dry-run` runs entirely unprivileged.

use clap::{Parser, Subcommand};
use podwall::config::{self, DeployConfig};
use podwall::core::apply;
use podwall::core::iptables::ExecSink;
use podwall::core::sink::{MemorySink, PolicySink};
use podwall::inventory::{FileInventory, InventorySource, pods_or_empty};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "podwall")]
#[command(about = "Per-endpoint access-control chain manager", long_about = None)]
struct Cli {
    /// Path to a configuration file (default: XDG data dir)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Path to the inventory file (default: XDG data dir)
    #[arg(long, global = true, value_name = "PATH")]
    inventory: Option<PathBuf>,

    /// Run against an in-memory sink instead of the kernel
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the chain hierarchy and synthesize per-endpoint chains
    Init {
        /// Seed for reproducible chain synthesis
        #[arg(long, value_name = "SEED")]
        seed: Option<u64>,
    },
    /// Compact every deployed per-endpoint chain
    Optimize,
    /// Remove every chain and rule this tool owns
    Clear,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    if let Err(e) = podwall::utils::ensure_dirs() {
        // Config and inventory loading fall back to defaults without it
        tracing::warn!(error = %e, "could not create data directory");
    }
    let cli = Cli::parse();

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    match runtime.block_on(handle_cli(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn load_config(cli: &Cli) -> Result<DeployConfig, Box<dyn std::error::Error>> {
    match &cli.config {
        Some(path) => Ok(config::load_config_from(path).await?),
        None => Ok(config::load_config().await),
    }
}

fn inventory_from(cli: &Cli) -> FileInventory {
    let path = cli.inventory.clone().unwrap_or_else(|| {
        let mut path = podwall::utils::get_data_dir().unwrap_or_default();
        path.push("inventory.json");
        path
    });
    FileInventory::new(path)
}

async fn handle_cli(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = load_config(&cli).await?;
    let inventory = inventory_from(&cli);

    if cli.dry_run {
        let mut sink = MemorySink::new();
        run_command(&cli, &cfg, &inventory, &mut sink).await
    } else {
        let mut sink = ExecSink::new(&cfg.iptables_path);
        run_command(&cli, &cfg, &inventory, &mut sink).await
    }
}

async fn run_command<S: PolicySink>(
    cli: &Cli,
    cfg: &DeployConfig,
    inventory: &FileInventory,
    sink: &mut S,
) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Init { seed } => {
            let pods = pods_or_empty(inventory).await;
            let mut rng = match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            };
            let summary = apply::initialize(sink, &mut rng, cfg, &pods).await?;
            println!(
                "Initialized {} endpoints: {} chains, {} rules ({} skipped)",
                summary.endpoints,
                summary.chains_created,
                summary.rules_applied,
                summary.skipped
            );
        }
        Commands::Optimize => {
            // No inventory, no partition: refuse rather than guess ranges
            let ranges = inventory.node_ranges().await?;
            let summary = apply::optimize(sink, cfg, &ranges).await?;
            println!(
                "Optimized {} chains: {} -> {} rules ({} skipped)",
                summary.chains,
                summary.rules_before,
                summary.rules_after,
                summary.skipped
            );
        }
        Commands::Clear => {
            let summary = apply::clear(sink).await?;
            println!(
                "Cleared {} chains, removed {} external references",
                summary.chains_deleted, summary.rules_deleted
            );
        }
    }
    Ok(())
}
