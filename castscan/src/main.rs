use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
#[cfg(any(feature = "discover", feature = "sweep"))]
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
#[cfg(feature = "discover")]
mod discover;
mod output;
#[cfg(feature = "sweep")]
mod sweep;

#[derive(Debug, Parser)]
#[command(name = "castscan", version, about = "Discover, validate and re-check multicast playlist relays")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./castscan.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// More log output (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Decode hosts from a page, probe candidate ports and store confirmed playlists
    #[cfg(feature = "discover")]
    Discover(discover::DiscoverArgs),
    /// Re-check stored playlists and evict the dead ones
    #[cfg(feature = "sweep")]
    Sweep(sweep::SweepArgs),
}

fn init_logging(cli: &Cli) -> Result<()> {
    let level = match (cli.quiet, cli.verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_target(false).with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| anyhow!("failed to initialize logging: {e}"))
}

/// Runtime plus a token cancelled on Ctrl-C.
#[cfg(any(feature = "discover", feature = "sweep"))]
fn runtime() -> Result<(tokio::runtime::Runtime, CancellationToken)> {
    let rt = tokio::runtime::Runtime::new()?;
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    rt.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; finishing in-flight work");
            token.cancel();
        }
    });
    Ok((rt, cancel))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;
    let loaded_cfg = config::load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Version => {
            println!("castscan {} (core {})", env!("CARGO_PKG_VERSION"), castscan_core::version());
        }
        #[cfg(feature = "discover")]
        Commands::Discover(args) => {
            let cfg = loaded_cfg.and_then(|c| c.discover).unwrap_or_default();
            let (rt, cancel) = runtime()?;
            discover::run(args, cfg, &rt, &cancel)?;
        }
        #[cfg(feature = "sweep")]
        Commands::Sweep(args) => {
            let cfg = loaded_cfg.and_then(|c| c.sweep).unwrap_or_default();
            let (rt, cancel) = runtime()?;
            sweep::run(args, cfg, &rt, &cancel)?;
        }
    }
    Ok(())
}
