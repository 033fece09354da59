use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use chaincni::config::{parse_duration, DEFAULT_CONFLICT_INTERVAL, DEFAULT_CONFLICT_RETRY, DEFAULT_OVERLAY_INTERFACE};
use chaincni::ipcheck;
use chaincni::netns::NetNs;
use chaincni::routing;
use chaincni::Error;

/// Diagnostics for the chained CNI plugins
#[derive(Parser)]
#[command(name = "chaincni-ctl", author, version, about)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run duplicate address detection for addresses on one interface
    Probe {
        /// Network namespace path (e.g. /var/run/netns/pod)
        #[arg(long)]
        netns: Option<PathBuf>,

        /// Interface to probe on
        #[arg(long)]
        ifname: String,

        /// Address to probe; repeat for more
        #[arg(long = "address", required = true)]
        addresses: Vec<IpAddr>,

        /// Probes sent per address
        #[arg(long, default_value_t = DEFAULT_CONFLICT_RETRY)]
        retry: u32,

        /// Time between probes (e.g. 200ms, 1s)
        #[arg(long, default_value = DEFAULT_CONFLICT_INTERVAL)]
        interval: String,
    },

    /// Show the rule table derived for an interface name
    Table {
        /// Chained interface name, e.g. net2
        name: String,

        /// Interface created by the overlay CNI
        #[arg(long, default_value = DEFAULT_OVERLAY_INTERFACE)]
        overlay: String,
    },
}

#[derive(Debug, Serialize)]
struct TableInfo {
    interface: String,
    table: Option<u32>,
    previous_interface: Option<String>,
}

fn table_info(name: &str, overlay: &str) -> TableInfo {
    TableInfo {
        interface: name.to_string(),
        table: routing::allocate_table(name),
        previous_interface: routing::previous_interface_name(name, overlay),
    }
}

fn parse_interval(interval: &str) -> Result<Duration> {
    let parsed = parse_duration(interval).map_err(|e| anyhow::anyhow!("invalid interval {interval:?}: {e}"))?;
    ipcheck::ensure_interval(parsed).with_context(|| format!("invalid interval {interval:?}"))?;
    Ok(parsed)
}

async fn probe(netns: Option<PathBuf>, ifname: &str, addresses: &[IpAddr], retry: u32, interval: &str) -> Result<()> {
    let interval = parse_interval(interval)?;
    let ns = match netns {
        Some(path) => NetNs::open(path)?,
        None => NetNs::current()?,
    };
    info!(netns = %ns.path().display(), ifname, ?addresses, retry, ?interval, "probing");

    match ipcheck::check_addresses(&ns, ifname, addresses, retry, interval).await {
        Ok(()) => {
            println!("no conflict for {} on {ifname}", display_list(addresses));
            Ok(())
        }
        Err(err @ Error::IpConflict { .. }) => {
            println!("{err}");
            Err(err.into())
        }
        Err(err) => Err(err).context("duplicate address detection failed"),
    }
}

fn display_list(addresses: &[IpAddr]) -> String {
    addresses.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    if let Err(err) = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .try_init()
    {
        eprintln!("failed to set up logging: {err}");
    }

    match cli.command {
        Commands::Probe {
            netns,
            ifname,
            addresses,
            retry,
            interval,
        } => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("Failed to create Tokio runtime")?;
            if let Err(err) = runtime.block_on(probe(netns, &ifname, &addresses, retry, &interval)) {
                error!("{err:#}");
                return Err(err);
            }
        }
        Commands::Table { name, overlay } => {
            let info = table_info(&name, &overlay);
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }

    Ok(())
}
