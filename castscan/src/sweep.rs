use crate::config::{SweepConfig as SweepFileConfig, DEFAULT_STORE};
use crate::output::{csv_writer, now_rfc3339, open_sink, OutputFormat};
use anyhow::{Context, Result};
use clap::Args;
use endpoint_store::{Catalog, HistoryStore, HISTORY_FILE};
use liveness::{LivenessSweeper, SweepConfig, SweepReport, Verdict};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Args)]
pub struct SweepArgs {
    /// Directory holding playlists and the history file
    #[arg(long)]
    pub store: Option<PathBuf>,
    #[arg(long)]
    pub history_file: Option<PathBuf>,
    /// Stream links opened per playlist
    #[arg(long)]
    pub sample_count: Option<usize>,
    /// Connect/response timeout per link in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,
    /// Time allowed for the first bytes of a stream in milliseconds
    #[arg(long)]
    pub read_timeout_ms: Option<u64>,
    /// Playlists checked concurrently
    #[arg(long)]
    pub concurrency: Option<usize>,
    /// Keep history records that have no playlist
    #[arg(long, default_value_t = false)]
    pub no_prune: bool,
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
    #[arg(long, value_name = "FILE")]
    pub out: Option<PathBuf>,
    #[arg(long, default_value_t = false, requires = "out")]
    pub csv: bool,
}

pub fn run(args: SweepArgs, cfg: SweepFileConfig, rt: &tokio::runtime::Runtime, cancel: &CancellationToken) -> Result<()> {
    let store = args.store.or(cfg.store.clone()).unwrap_or_else(|| PathBuf::from(DEFAULT_STORE));
    let history_file = args.history_file.or(cfg.history_file.clone()).unwrap_or_else(|| store.join(HISTORY_FILE));
    let format = args.format.or(cfg.format.as_deref().map(OutputFormat::from_config)).unwrap_or_default();
    let defaults = SweepConfig::default();
    let sweep_cfg = SweepConfig {
        sample_count: args.sample_count.or(cfg.sample_count).unwrap_or(defaults.sample_count),
        timeout: args.timeout_ms.or(cfg.timeout_ms).map(Duration::from_millis).unwrap_or(defaults.timeout),
        read_timeout: args
            .read_timeout_ms
            .or(cfg.read_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(defaults.read_timeout),
        concurrency: args.concurrency.or(cfg.concurrency).unwrap_or(defaults.concurrency),
        prune_orphans: !args.no_prune && cfg.prune_orphans.unwrap_or(defaults.prune_orphans),
        user_agents: cfg.user_agents.clone().unwrap_or_default(),
    };

    let history = Arc::new(HistoryStore::open(&history_file).context("opening history")?);
    let catalog = Arc::new(Catalog::open(&store).context("opening catalog")?);
    let sweeper = LivenessSweeper::new(sweep_cfg, history, catalog)?;

    let started = Instant::now();
    let started_at = now_rfc3339();
    let report = rt.block_on(sweeper.sweep(cancel))?;
    let duration_ms = started.elapsed().as_millis();
    let ended_at = now_rfc3339();

    if args.csv {
        if let Some(path) = &args.out {
            let mut wtr = csv_writer(path)?;
            wtr.write_record(["file", "host", "port", "verdict", "sampled", "evicted", "checked_at"])?;
            for a in &report.artifacts {
                let host = a.host.map(|h| h.to_string()).unwrap_or_default();
                let port = a.port.map(|p| p.to_string()).unwrap_or_default();
                wtr.write_record([
                    a.file.as_str(),
                    host.as_str(),
                    port.as_str(),
                    verdict_name(a.verdict),
                    a.sampled.to_string().as_str(),
                    a.evicted.to_string().as_str(),
                    ended_at.as_str(),
                ])?;
            }
            wtr.flush()?;
            return Ok(());
        }
    }

    let mut w = open_sink(args.out.as_deref())?;
    match format {
        OutputFormat::Text => write_text(&mut w, &report, duration_ms)?,
        OutputFormat::Json => {
            let obj = serde_json::json!({
                "store": store,
                "started_at": started_at,
                "ended_at": ended_at,
                "duration_ms": duration_ms,
                "report": report,
            });
            writeln!(w, "{}", serde_json::to_string(&obj)?)?;
        }
        OutputFormat::Jsonl => {
            for a in &report.artifacts {
                writeln!(w, "{}", serde_json::to_string(a)?)?;
            }
        }
    }
    w.flush()?;
    Ok(())
}

fn verdict_name(v: Verdict) -> &'static str {
    match v {
        Verdict::Alive => "alive",
        Verdict::Dead => "dead",
        Verdict::Unchecked => "unchecked",
    }
}

fn write_text(w: &mut dyn Write, report: &SweepReport, duration_ms: u128) -> Result<()> {
    for a in &report.artifacts {
        writeln!(w, "{}: {} ({} links sampled, {} history records evicted)", a.file, verdict_name(a.verdict), a.sampled, a.evicted)?;
    }
    writeln!(
        w,
        "({} playlists, {} alive, {} removed, {} orphans pruned, took {} ms)",
        report.artifacts.len(),
        report.alive(),
        report.removed,
        report.orphans_pruned,
        duration_ms
    )?;
    Ok(())
}
