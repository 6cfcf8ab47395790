//! Liveness sweep over catalogued playlists.
//!
//! Each artifact is judged by sampling its stream links. Dead artifacts are deleted together with
//! every history record of their host; live ones are left untouched.

mod links;

pub use links::{extract_stream_links, LinkChecker};

use anyhow::{Context, Result};
use endpoint_store::{Catalog, CatalogEntry, HistoryStore};
use serde::Serialize;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Links opened per artifact, taken from the top of the playlist.
    pub sample_count: usize,
    pub timeout: Duration,
    pub read_timeout: Duration,
    pub concurrency: usize,
    /// Drop history records whose host has no artifact once the sweep is done.
    pub prune_orphans: bool,
    pub user_agents: Vec<String>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        SweepConfig {
            sample_count: 2,
            timeout: Duration::from_secs(8),
            read_timeout: Duration::from_secs(5),
            concurrency: 8,
            prune_orphans: true,
            user_agents: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Alive,
    Dead,
    /// The sweep was cancelled before this artifact was checked.
    Unchecked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactReport {
    pub file: String,
    pub host: Option<Ipv4Addr>,
    pub port: Option<u16>,
    pub verdict: Verdict,
    pub sampled: usize,
    /// History records removed along with this artifact.
    pub evicted: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub artifacts: Vec<ArtifactReport>,
    pub removed: usize,
    pub evicted: usize,
    pub orphans_pruned: usize,
    pub interrupted: bool,
}

impl SweepReport {
    pub fn alive(&self) -> usize {
        self.artifacts.iter().filter(|a| a.verdict == Verdict::Alive).count()
    }
}

pub struct LivenessSweeper {
    cfg: SweepConfig,
    checker: LinkChecker,
    history: Arc<HistoryStore>,
    catalog: Arc<Catalog>,
}

impl LivenessSweeper {
    pub fn new(cfg: SweepConfig, history: Arc<HistoryStore>, catalog: Arc<Catalog>) -> Result<Self> {
        let checker = LinkChecker::new(cfg.timeout, cfg.read_timeout, cfg.user_agents.clone())?;
        Ok(LivenessSweeper { cfg, checker, history, catalog })
    }

    pub async fn sweep(&self, cancel: &CancellationToken) -> Result<SweepReport> {
        let entries = self.catalog.entries().context("listing catalog")?;
        info!(artifacts = entries.len(), "sweep started");

        let sem = Arc::new(Semaphore::new(self.cfg.concurrency.max(1)));
        let (tx, mut rx) = mpsc::channel::<(usize, Result<(Verdict, usize)>)>(entries.len().max(1));
        for (idx, entry) in entries.iter().enumerate() {
            let tx = tx.clone();
            let sem = sem.clone();
            let checker = self.checker.clone();
            let catalog = self.catalog.clone();
            let cancel = cancel.clone();
            let entry = entry.clone();
            let sample = self.cfg.sample_count.max(1);
            tokio::spawn(async move {
                let Ok(_permit) = sem.acquire_owned().await else { return };
                let res = judge(&checker, &catalog, &entry, sample, &cancel).await;
                let _ = tx.send((idx, res)).await;
            });
        }
        drop(tx);

        let mut verdicts = Vec::with_capacity(entries.len());
        while let Some((idx, res)) = rx.recv().await {
            verdicts.push((idx, res?));
        }
        verdicts.sort_by_key(|(idx, _)| *idx);

        let mut report = SweepReport::default();
        for (idx, (verdict, sampled)) in verdicts {
            let entry = &entries[idx];
            let evicted = match verdict {
                Verdict::Dead => self.evict(entry)?,
                Verdict::Alive => 0,
                Verdict::Unchecked => {
                    report.interrupted = true;
                    0
                }
            };
            if verdict == Verdict::Dead {
                report.removed += 1;
            }
            report.evicted += evicted;
            report.artifacts.push(ArtifactReport {
                file: entry.file_name(),
                host: entry.key.as_ref().map(|k| *k.addr.ip()),
                port: entry.key.as_ref().map(|k| k.addr.port()),
                verdict,
                sampled,
                evicted,
            });
        }

        if self.cfg.prune_orphans && !report.interrupted {
            report.orphans_pruned = self.prune_orphans()?;
        }
        info!(
            checked = report.artifacts.len(),
            alive = report.alive(),
            removed = report.removed,
            evicted = report.evicted,
            orphans = report.orphans_pruned,
            "sweep finished"
        );
        Ok(report)
    }

    /// Delete the artifact first, then the history of its host.
    fn evict(&self, entry: &CatalogEntry) -> Result<usize> {
        self.catalog.remove(entry).context("removing dead artifact")?;
        let Some(key) = &entry.key else {
            warn!(file = %entry.file_name(), "dead artifact removed; name matched no history record");
            return Ok(0);
        };
        let host = *key.addr.ip();
        let evicted = self.history.evict_host(host).context("evicting history")?;
        info!(%host, port = key.addr.port(), label = %key.label, evicted, state = "dead", "artifact removed");
        Ok(evicted)
    }

    /// Remove history records whose host owns no artifact. Skipped while any artifact name does
    /// not parse, since such a file may still belong to a recorded host.
    pub fn prune_orphans(&self) -> Result<usize> {
        let entries = self.catalog.entries().context("listing catalog")?;
        if let Some(stray) = entries.iter().find(|e| e.key.is_none()) {
            warn!(file = %stray.file_name(), "unparsable artifact name; orphan pruning skipped");
            return Ok(0);
        }
        let hosts: BTreeSet<Ipv4Addr> = entries.iter().filter_map(|e| e.key.as_ref().map(|k| *k.addr.ip())).collect();
        let mut pruned = 0;
        for record in self.history.records() {
            if hosts.contains(record.addr.ip()) {
                continue;
            }
            if self.history.evict(record.addr).context("pruning history")? {
                debug!(endpoint = %record.addr, "orphan history record pruned");
                pruned += 1;
            }
        }
        Ok(pruned)
    }
}

async fn judge(
    checker: &LinkChecker,
    catalog: &Catalog,
    entry: &CatalogEntry,
    sample: usize,
    cancel: &CancellationToken,
) -> Result<(Verdict, usize)> {
    if cancel.is_cancelled() {
        return Ok((Verdict::Unchecked, 0));
    }
    let payload = catalog.read(entry).context("reading artifact")?;
    let mut links = extract_stream_links(&String::from_utf8_lossy(&payload));
    links.truncate(sample);
    let sampled = links.len();
    if links.is_empty() {
        debug!(file = %entry.file_name(), "no stream links");
        return Ok((Verdict::Dead, 0));
    }
    let alive = tokio::select! {
        alive = checker.any_alive(links) => alive,
        _ = cancel.cancelled() => return Ok((Verdict::Unchecked, sampled)),
    };
    Ok((if alive { Verdict::Alive } else { Verdict::Dead }, sampled))
}
