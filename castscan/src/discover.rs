use crate::config::{DiscoverConfig, DEFAULT_STORE};
use crate::output::{csv_writer, now_rfc3339, open_sink, OutputFormat};
use anyhow::{anyhow, Context, Result};
use castscan_core::Pacing;
use clap::Args;
use endpoint_store::{Catalog, HistoryStore, RotationPeriod, HISTORY_FILE};
use engine::{DiscoveryEngine, EngineConfig, HostOrder, HostState, RunReport};
use playlist_probe::{EndpointProbe, LabelRule, ProbeOptions, RequestShape, Signature, DEFAULT_PROBE_URL};
use port_plan::{LookupOptions, PortLookup, DEFAULT_LOOKUP_URL};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Debug, Args)]
pub struct DiscoverArgs {
    /// File holding the fetched page text with encoded hosts
    pub source: Option<PathBuf>,
    /// Directory for playlists and the history file
    #[arg(long)]
    pub store: Option<PathBuf>,
    /// History file (default: <store>/history.txt)
    #[arg(long)]
    pub history_file: Option<PathBuf>,
    /// Endpoint category carried by page calls and probes
    #[arg(long)]
    pub tag: Option<String>,
    /// Static port priority list, e.g. 8080,4000-4003
    #[arg(long)]
    pub ports: Option<String>,
    /// Skip hosts with at least this many confirmed ports
    #[arg(long)]
    pub ports_per_host: Option<usize>,
    /// Candidates probed per host (default: all)
    #[arg(long)]
    pub probe_budget: Option<usize>,
    /// Probe timeout in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,
    /// Hosts probed concurrently
    #[arg(long)]
    pub concurrency: Option<usize>,
    #[arg(long)]
    pub max_hosts: Option<usize>,
    /// first-seen-first or last-seen-first
    #[arg(long)]
    pub host_order: Option<HostOrder>,
    /// daily, weekly, monthly or never
    #[arg(long)]
    pub rotation: Option<RotationPeriod>,
    /// Overall run deadline in seconds; 0 disables it
    #[arg(long)]
    pub run_timeout_secs: Option<u64>,
    /// Disable delays between requests
    #[arg(long, default_value_t = false)]
    pub no_pacing: bool,
    /// Skip the external port lookup
    #[arg(long, default_value_t = false)]
    pub no_intel: bool,
    /// Also take bare dotted-quad hosts from the page
    #[arg(long, default_value_t = false)]
    pub plain_hosts: bool,
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
    /// Output file (overwrites)
    #[arg(long, value_name = "FILE")]
    pub out: Option<PathBuf>,
    /// Write CSV to --out instead of text/json
    #[arg(long, default_value_t = false, requires = "out")]
    pub csv: bool,
}

fn pacing(range: Option<[u64; 2]>, default: [u64; 2], off: bool) -> Pacing {
    if off {
        return Pacing::Off;
    }
    let [min, max] = range.unwrap_or(default);
    Pacing::jitter_ms(min, max)
}

pub fn run(args: DiscoverArgs, cfg: DiscoverConfig, rt: &tokio::runtime::Runtime, cancel: &CancellationToken) -> Result<()> {
    let source = args
        .source
        .or(cfg.source.clone())
        .ok_or_else(|| anyhow!("provide a source page file (argument or discover.source in config)"))?;
    let page = fs::read_to_string(&source).with_context(|| format!("reading source page {}", source.display()))?;

    let store = args.store.or(cfg.store.clone()).unwrap_or_else(|| PathBuf::from(DEFAULT_STORE));
    let history_file = args.history_file.or(cfg.history_file.clone()).unwrap_or_else(|| store.join(HISTORY_FILE));
    let tag = args.tag.or(cfg.tag.clone()).unwrap_or_else(|| "multicast".into());
    let static_ports = match args.ports.or(cfg.ports.clone()) {
        Some(spec) => port_plan::parse_ports(&spec)?,
        None => port_plan::default_static_ports(),
    };
    let host_order = match (args.host_order, &cfg.host_order) {
        (Some(o), _) => o,
        (None, Some(s)) => s.parse().map_err(|e: String| anyhow!(e))?,
        (None, None) => HostOrder::default(),
    };
    let timeout_ms = args.timeout_ms.or(cfg.timeout_ms).unwrap_or(12_000);
    let run_timeout_secs = args.run_timeout_secs.or(cfg.run_timeout_secs).unwrap_or(1800);
    let format = args.format.or(cfg.format.as_deref().map(OutputFormat::from_config)).unwrap_or_default();
    let user_agents = cfg.user_agents.clone().unwrap_or_default();

    let engine_cfg = EngineConfig {
        tag: tag.clone(),
        max_hosts: args.max_hosts.or(cfg.max_hosts).unwrap_or(6),
        host_order,
        ports_per_host: args.ports_per_host.or(cfg.ports_per_host).unwrap_or(1),
        probe_budget: args.probe_budget.or(cfg.probe_budget),
        concurrency: args.concurrency.or(cfg.concurrency).unwrap_or(4),
        run_timeout: (run_timeout_secs > 0).then(|| Duration::from_secs(run_timeout_secs)),
        static_ports,
        page_hints: cfg.page_hints.unwrap_or(true),
        plain_hosts: args.plain_hosts || cfg.plain_hosts.unwrap_or(false),
        rotation: args.rotation.or(cfg.rotation).unwrap_or_default(),
    };

    let probe_url = cfg.probe_url.as_deref().unwrap_or(DEFAULT_PROBE_URL);
    let probe_url = Url::parse(probe_url).with_context(|| format!("invalid probe_url {probe_url}"))?;
    let signature = Signature { min_entries: cfg.min_entries.unwrap_or(5), ..Signature::default() };
    let probe_opts = ProbeOptions {
        timeout: Duration::from_millis(timeout_ms),
        user_agents: user_agents.clone(),
        referer: cfg.referer.clone(),
        ..ProbeOptions::default()
    };
    let probe = EndpointProbe::new(RequestShape::new(probe_url, tag), signature, probe_opts)?;

    let defaults = LabelRule::default();
    let labels = LabelRule {
        field: cfg.label_field.clone().unwrap_or(defaults.field),
        strip_suffixes: cfg.label_suffixes.clone().unwrap_or(defaults.strip_suffixes),
        fallback: cfg.label_fallback.clone().unwrap_or(defaults.fallback),
    };

    let history = Arc::new(HistoryStore::open(&history_file).context("opening history")?);
    let catalog = Arc::new(Catalog::open(&store).context("opening catalog")?);
    let mut engine = DiscoveryEngine::new(engine_cfg, probe, history, catalog)
        .with_labels(labels)
        .with_pacing(pacing(cfg.pacing_ms, [3000, 7000], args.no_pacing));
    if !args.no_intel && cfg.intel.unwrap_or(true) {
        let intel_url = cfg.intel_url.as_deref().unwrap_or(DEFAULT_LOOKUP_URL);
        let mut opts = LookupOptions::new(Url::parse(intel_url).with_context(|| format!("invalid intel_url {intel_url}"))?);
        opts.user_agents = user_agents;
        let lookup = PortLookup::new(opts)?;
        engine = engine.with_lookup(lookup, pacing(cfg.intel_pacing_ms, [5000, 10_000], args.no_pacing));
    }

    let started = Instant::now();
    let started_at = now_rfc3339();
    let report = rt.block_on(engine.run(&page, cancel))?;
    let duration_ms = started.elapsed().as_millis();
    let ended_at = now_rfc3339();

    if args.csv {
        if let Some(path) = &args.out {
            let mut wtr = csv_writer(path)?;
            wtr.write_record(["host", "state", "port", "label", "origin", "probes", "started_at", "ended_at"])?;
            for h in &report.hosts {
                let (port, label, origin) = match &h.state {
                    HostState::Hit { port, label, origin, .. } => (port.to_string(), label.clone(), origin.to_string()),
                    _ => Default::default(),
                };
                let host = h.host.to_string();
                let probes = h.state.probes().to_string();
                wtr.write_record([
                    host.as_str(),
                    h.state.name(),
                    port.as_str(),
                    label.as_str(),
                    origin.as_str(),
                    probes.as_str(),
                    started_at.as_str(),
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
                "source": source,
                "store": store,
                "started_at": started_at,
                "ended_at": ended_at,
                "duration_ms": duration_ms,
                "report": report,
            });
            writeln!(w, "{}", serde_json::to_string(&obj)?)?;
        }
        OutputFormat::Jsonl => {
            for h in &report.hosts {
                writeln!(w, "{}", serde_json::to_string(h)?)?;
            }
        }
    }
    w.flush()?;
    Ok(())
}

fn write_text(w: &mut dyn Write, report: &RunReport, duration_ms: u128) -> Result<()> {
    for h in &report.hosts {
        match &h.state {
            HostState::Hit { port, label, origin, probes, .. } => {
                writeln!(w, "{}: hit on port {} [{}] via {} ({} probes)", h.host, port, label, origin, probes)?
            }
            HostState::Skipped { confirmed } => {
                let list = confirmed.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(",");
                writeln!(w, "{}: skipped, confirmed [{}]", h.host, list)?
            }
            HostState::Exhausted { probes, interrupted } => {
                let note = if *interrupted { ", interrupted" } else { "" };
                writeln!(w, "{}: no playlist ({} probes{})", h.host, probes, note)?
            }
        }
    }
    writeln!(
        w,
        "({} hosts, {} hits, {} probes, {} undecodable, rotated: {}, took {} ms)",
        report.hosts.len(),
        report.hits().count(),
        report.probes(),
        report.decode_failures,
        report.rotated,
        duration_ms
    )?;
    Ok(())
}
