//! CLI entry point for the netres ledger tool.
//!
//! Writes JSON results to stdout and structured logs to stderr, so the
//! output can be consumed by provisioning scripts.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use netres_core::ReservationConfig;
use netres_reserve::{Hypervisor, ReservationSession, StaticHypervisor, VirshHypervisor};

#[derive(Parser)]
#[command(name = "netres")]
#[command(about = "Conflict-free network assets for test runs sharing a hypervisor")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file prefix (default: netres).
    #[arg(short, long, default_value = "netres", global = true)]
    config: String,
}

#[derive(Subcommand)]
enum Command {
    /// Print the ledger.
    Show,
    /// Reserve assets and leave them in the ledger for a provisioner.
    Acquire {
        /// Number of assets to reserve.
        #[arg(long, default_value_t = 1)]
        count: usize,
        /// Do not query the hypervisor for DHCP leases.
        #[arg(long)]
        no_hypervisor: bool,
    },
    /// Remove a ledger entry by its primary bridge name.
    Reclaim {
        /// Primary bridge name of the entry, e.g. test3.
        network_if: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let config = ReservationConfig::load(&cli.config)?;

    match cli.command {
        Command::Show => {
            let session = ReservationSession::new(&config, Arc::new(StaticHypervisor::new()));
            let entries = session.snapshot().await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        Command::Acquire {
            count,
            no_hypervisor,
        } => {
            let hypervisor = connect_hypervisor(&config, no_hypervisor).await?;
            let mut session = ReservationSession::new(&config, hypervisor);

            let mut assets = Vec::with_capacity(count);
            for _ in 0..count {
                assets.push(session.acquire().await?);
            }
            println!("{}", serde_json::to_string_pretty(&assets)?);
        }
        Command::Reclaim { network_if } => {
            let session = ReservationSession::new(&config, Arc::new(StaticHypervisor::new()));
            match session.reclaim(&network_if).await? {
                Some(asset) => println!("{}", serde_json::to_string_pretty(&asset)?),
                None => anyhow::bail!("No ledger entry with network_if {network_if}"),
            }
        }
    }

    Ok(())
}

async fn connect_hypervisor(
    config: &ReservationConfig,
    skip: bool,
) -> anyhow::Result<Arc<dyn Hypervisor>> {
    if skip {
        tracing::info!("Hypervisor lease scan disabled");
        return Ok(Arc::new(StaticHypervisor::new()));
    }

    let virsh = VirshHypervisor::new(&config.virsh_path, &config.libvirt_uri);
    let version = virsh.verify_installation().await?;
    tracing::info!(virsh_version = %version, uri = %config.libvirt_uri, "virsh verified");
    Ok(Arc::new(virsh))
}
