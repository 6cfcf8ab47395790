use anyhow::{Context, Result};
use endpoint_store::RotationPeriod;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "castscan.yaml";
/// Playlist directory used when neither flag nor config names one.
pub const DEFAULT_STORE: &str = "playlists";

#[derive(Debug, Default, Deserialize, Clone)]
pub struct DiscoverConfig {
    pub store: Option<PathBuf>,
    pub source: Option<PathBuf>,
    pub history_file: Option<PathBuf>,
    pub tag: Option<String>,
    pub ports: Option<String>,
    pub ports_per_host: Option<usize>,
    pub probe_budget: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub pacing_ms: Option<[u64; 2]>,
    pub intel_pacing_ms: Option<[u64; 2]>,
    pub rotation: Option<RotationPeriod>,
    pub max_hosts: Option<usize>,
    pub host_order: Option<String>,
    pub concurrency: Option<usize>,
    pub run_timeout_secs: Option<u64>,
    pub probe_url: Option<String>,
    pub intel: Option<bool>,
    pub intel_url: Option<String>,
    pub min_entries: Option<usize>,
    pub label_field: Option<String>,
    pub label_suffixes: Option<Vec<String>>,
    pub label_fallback: Option<String>,
    pub plain_hosts: Option<bool>,
    pub page_hints: Option<bool>,
    pub user_agents: Option<Vec<String>>,
    pub referer: Option<String>,
    pub format: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct SweepConfig {
    pub store: Option<PathBuf>,
    pub history_file: Option<PathBuf>,
    pub sample_count: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    pub concurrency: Option<usize>,
    pub prune_orphans: Option<bool>,
    pub user_agents: Option<Vec<String>>,
    pub format: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    pub discover: Option<DiscoverConfig>,
    pub sweep: Option<SweepConfig>,
}

/// Load `path`, or `./castscan.yaml` when no path is given and it exists.
/// A file that exists but cannot be read or parsed is an error.
pub fn load_config(path: Option<&Path>) -> Result<Option<Config>> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_CONFIG_FILE);
            if p.exists() { p.to_path_buf() } else { return Ok(None); }
        }
    };
    let s = fs::read_to_string(&path).with_context(|| format!("reading config {}", path.display()))?;
    let cfg = serde_yaml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))?;
    Ok(Some(cfg))
}
