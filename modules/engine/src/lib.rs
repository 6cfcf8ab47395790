//! Discovery run: decode hosts from page text, probe candidate ports per host with a bounded
//! worker pool, and persist the first confirmed endpoint of each host.

use anyhow::{Context, Result};
use castscan_core::{Candidate, Origin, Pacing};
use endpoint_store::{Artifact, ArtifactKey, Catalog, HistoryStore, RotationPeriod};
use host_decode::{page_hints, scan_hosts, scan_plain_hosts, HostScan};
use playlist_probe::{EndpointProbe, LabelRule};
use port_plan::{plan_candidates, PortLookup};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostOrder {
    FirstSeenFirst,
    /// Reverse page order before truncating to `max_hosts`.
    #[default]
    LastSeenFirst,
}

impl FromStr for HostOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().replace('-', "_").as_str() {
            "first_seen_first" => Ok(HostOrder::FirstSeenFirst),
            "last_seen_first" => Ok(HostOrder::LastSeenFirst),
            other => Err(format!("unknown host order: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Category carried by page calls and sent with every probe.
    pub tag: String,
    pub max_hosts: usize,
    pub host_order: HostOrder,
    /// Hosts with at least this many confirmed ports are skipped.
    pub ports_per_host: usize,
    /// Candidates probed per host; `None` probes all of them.
    pub probe_budget: Option<usize>,
    pub concurrency: usize,
    pub run_timeout: Option<Duration>,
    pub static_ports: Vec<u16>,
    pub page_hints: bool,
    pub plain_hosts: bool,
    pub rotation: RotationPeriod,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            tag: "multicast".into(),
            max_hosts: 6,
            host_order: HostOrder::default(),
            ports_per_host: 1,
            probe_budget: None,
            concurrency: 4,
            run_timeout: Some(Duration::from_secs(1800)),
            static_ports: port_plan::default_static_ports(),
            page_hints: true,
            plain_hosts: false,
            rotation: RotationPeriod::Weekly,
        }
    }
}

/// Terminal state of one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HostState {
    Skipped { confirmed: Vec<u16> },
    Hit { port: u16, label: String, origin: Origin, probes: usize, artifact: PathBuf },
    Exhausted { probes: usize, interrupted: bool },
}

impl HostState {
    pub fn name(&self) -> &'static str {
        match self {
            HostState::Skipped { .. } => "skipped",
            HostState::Hit { .. } => "hit",
            HostState::Exhausted { .. } => "exhausted",
        }
    }

    pub fn probes(&self) -> usize {
        match self {
            HostState::Skipped { .. } => 0,
            HostState::Hit { probes, .. } | HostState::Exhausted { probes, .. } => *probes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostReport {
    pub host: Ipv4Addr,
    #[serde(flatten)]
    pub state: HostState,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    /// Hosts in selection order.
    pub hosts: Vec<HostReport>,
    pub decoded: usize,
    pub decode_failures: usize,
    pub non_routable: usize,
    pub rotated: bool,
    pub interrupted: bool,
    pub lookup_blocked: bool,
}

impl RunReport {
    pub fn hits(&self) -> impl Iterator<Item = &HostReport> {
        self.hosts.iter().filter(|h| matches!(h.state, HostState::Hit { .. }))
    }

    pub fn probes(&self) -> usize {
        self.hosts.iter().map(|h| h.state.probes()).sum()
    }
}

/// Hosts a run will visit, plus the decode bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub hosts: Vec<Ipv4Addr>,
    pub scan: HostScan,
}

pub fn select_hosts(page: &str, cfg: &EngineConfig) -> Selection {
    let mut scan = scan_hosts(page, &cfg.tag);
    if cfg.plain_hosts {
        scan.merge(scan_plain_hosts(page));
    }
    let mut hosts = scan.hosts.clone();
    if cfg.host_order == HostOrder::LastSeenFirst {
        hosts.reverse();
    }
    hosts.truncate(cfg.max_hosts);
    Selection { hosts, scan }
}

/// Shared state of a discovery run. Cloning is cheap; workers each hold a clone.
#[derive(Clone)]
pub struct DiscoveryEngine {
    cfg: Arc<EngineConfig>,
    probe: Arc<EndpointProbe>,
    labels: Arc<LabelRule>,
    lookup: Option<Arc<PortLookup>>,
    probe_pacing: Pacing,
    lookup_pacing: Pacing,
    history: Arc<HistoryStore>,
    catalog: Arc<Catalog>,
}

impl DiscoveryEngine {
    pub fn new(cfg: EngineConfig, probe: EndpointProbe, history: Arc<HistoryStore>, catalog: Arc<Catalog>) -> Self {
        DiscoveryEngine {
            cfg: Arc::new(cfg),
            probe: Arc::new(probe),
            labels: Arc::new(LabelRule::default()),
            lookup: None,
            probe_pacing: Pacing::Off,
            lookup_pacing: Pacing::Off,
            history,
            catalog,
        }
    }

    pub fn with_labels(mut self, rule: LabelRule) -> Self {
        self.labels = Arc::new(rule);
        self
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.probe_pacing = pacing;
        self
    }

    /// Enable the external port lookup, paced independently of probes.
    pub fn with_lookup(mut self, lookup: PortLookup, pacing: Pacing) -> Self {
        self.lookup = Some(Arc::new(lookup));
        self.lookup_pacing = pacing;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub async fn run(&self, page: &str, cancel: &CancellationToken) -> Result<RunReport> {
        self.run_at(page, OffsetDateTime::now_utc(), cancel).await
    }

    /// Run against `page` as if the clock read `now` for rotation purposes.
    pub async fn run_at(&self, page: &str, now: OffsetDateTime, cancel: &CancellationToken) -> Result<RunReport> {
        let rotated = self
            .history
            .rotate_if_boundary_crossed(now, self.cfg.rotation)
            .context("rotating history")?;

        let Selection { hosts, scan } = select_hosts(page, &self.cfg);
        info!(
            selected = hosts.len(),
            decoded = scan.hosts.len(),
            failures = scan.failures.len(),
            non_routable = scan.internal.len(),
            "hosts selected"
        );

        let run_cancel = cancel.child_token();
        let deadline = self.cfg.run_timeout.map(|limit| {
            let token = run_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                if !token.is_cancelled() {
                    warn!(secs = limit.as_secs_f64(), "run deadline reached; stopping");
                    token.cancel();
                }
            })
        });

        let page: Arc<str> = Arc::from(page);
        let sem = Arc::new(Semaphore::new(self.cfg.concurrency.max(1)));
        let (tx, mut rx) = mpsc::channel::<(usize, Result<HostReport>)>(hosts.len().max(1));
        for (idx, host) in hosts.iter().copied().enumerate() {
            let tx = tx.clone();
            let sem = sem.clone();
            let engine = self.clone();
            let page = page.clone();
            let cancel = run_cancel.clone();
            tokio::spawn(async move {
                let Ok(_permit) = sem.acquire_owned().await else { return };
                let report = engine.process(host, &page, &cancel).await;
                let _ = tx.send((idx, report)).await;
            });
        }
        drop(tx);

        let mut reports = Vec::with_capacity(hosts.len());
        let mut failure = None;
        while let Some((idx, res)) = rx.recv().await {
            match res {
                Ok(r) => reports.push((idx, r)),
                Err(e) => {
                    if failure.is_none() {
                        run_cancel.cancel();
                        failure = Some(e);
                    }
                }
            }
        }
        if let Some(handle) = deadline {
            handle.abort();
        }
        if let Some(e) = failure {
            return Err(e);
        }
        reports.sort_by_key(|(idx, _)| *idx);

        let hosts: Vec<HostReport> = reports.into_iter().map(|(_, r)| r).collect();
        let report = RunReport {
            interrupted: hosts.iter().any(|h| matches!(h.state, HostState::Exhausted { interrupted: true, .. })),
            lookup_blocked: self.lookup.as_ref().is_some_and(|l| l.is_blocked()),
            decoded: scan.hosts.len(),
            decode_failures: scan.failures.len(),
            non_routable: scan.internal.len(),
            rotated,
            hosts,
        };
        info!(
            hosts = report.hosts.len(),
            hits = report.hits().count(),
            probes = report.probes(),
            interrupted = report.interrupted,
            "discovery finished"
        );
        Ok(report)
    }

    async fn process(&self, host: Ipv4Addr, page: &str, cancel: &CancellationToken) -> Result<HostReport> {
        let report = |state| HostReport { host, state };
        let interrupted = |probes| report(HostState::Exhausted { probes, interrupted: true });

        let confirmed = self.history.ports_for(host);
        if confirmed.len() >= self.cfg.ports_per_host.max(1) {
            debug!(%host, ports = ?confirmed, state = "skipped", "host already confirmed");
            return Ok(report(HostState::Skipped { confirmed }));
        }
        if cancel.is_cancelled() {
            return Ok(interrupted(0));
        }

        let external = match &self.lookup {
            Some(lookup) if !lookup.is_blocked() => {
                if !self.lookup_pacing.pause(cancel).await {
                    return Ok(interrupted(0));
                }
                lookup.lookup(host).await.ports().to_vec()
            }
            _ => Vec::new(),
        };
        let hints = if self.cfg.page_hints { page_hints(page, host) } else { Vec::new() };
        let mut candidates = plan_candidates(host, &external, &hints, &self.cfg.static_ports);
        candidates.retain(|c| !confirmed.contains(&c.port()));
        if let Some(budget) = self.cfg.probe_budget {
            candidates.truncate(budget);
        }
        debug!(%host, candidates = candidates.len(), external = external.len(), hints = hints.len(), "probing host");

        let mut probes = 0;
        for candidate in candidates {
            if !self.probe_pacing.pause(cancel).await {
                return Ok(interrupted(probes));
            }
            probes += 1;
            let outcome = tokio::select! {
                out = self.probe.probe(&candidate) => out,
                _ = cancel.cancelled() => return Ok(interrupted(probes)),
            };
            if cancel.is_cancelled() {
                return Ok(interrupted(probes));
            }
            if !outcome.success {
                debug!(%host, port = candidate.port(), status = ?outcome.status, error = ?outcome.error, "miss");
                continue;
            }

            let payload = outcome.payload.unwrap_or_default();
            let label = self.labels.classify(&String::from_utf8_lossy(&payload));
            let Some(artifact) = self.commit(&candidate, &label, payload, outcome.observed_at)? else {
                debug!(%host, port = candidate.port(), "endpoint claimed elsewhere");
                return Ok(report(HostState::Skipped { confirmed: vec![candidate.port()] }));
            };
            info!(%host, port = candidate.port(), %label, origin = %candidate.origin, probes, state = "hit", "endpoint confirmed");
            return Ok(report(HostState::Hit {
                port: candidate.port(),
                label,
                origin: candidate.origin,
                probes,
                artifact,
            }));
        }
        debug!(%host, probes, state = "exhausted", "no candidate answered");
        Ok(report(HostState::Exhausted { probes, interrupted: false }))
    }

    /// Claim the history record, then write the artifact. A failed write releases the claim.
    fn commit(&self, candidate: &Candidate, label: &str, payload: Vec<u8>, at: OffsetDateTime) -> Result<Option<PathBuf>> {
        if !self.history.record(candidate.addr).context("recording confirmed endpoint")? {
            return Ok(None);
        }
        let artifact = Artifact { key: ArtifactKey::new(label, candidate.addr), payload, created_at: at };
        match self.catalog.write(&artifact) {
            Ok(path) => Ok(Some(path)),
            Err(e) => {
                if let Err(rollback) = self.history.evict(candidate.addr) {
                    warn!(endpoint = %candidate, error = %rollback, "could not release history claim");
                }
                Err(e).with_context(|| format!("writing artifact for {candidate}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use endpoint_store::HISTORY_FILE;
    use playlist_probe::{ProbeOptions, RequestShape, Signature};
    use port_plan::LookupOptions;
    use std::fs;
    use tempfile::TempDir;
    use time::macros::datetime;
    use url::Url;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const HOST: Ipv4Addr = Ipv4Addr::new(88, 1, 2, 3);

    fn call(ip: &str) -> String {
        format!("<a onclick=\"gotoIP('{}', 'multicast')\">{ip}</a>\n", STANDARD.encode(ip))
    }

    fn playlist(entries: usize) -> String {
        let mut s = String::from("#EXTM3U\n");
        for i in 0..entries {
            s.push_str(&format!("#EXTINF:-1 group-title=\"湖北 湖北电信组播\",CCTV{i}\nhttp://88.1.2.3:8080/rtp/239.1.1.{i}:5002\n"));
        }
        s
    }

    async fn answer(server: &MockServer, endpoint: &str, body: String, times: u64) {
        Mock::given(method("GET"))
            .and(path("/index.php"))
            .and(query_param("s", endpoint))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(times)
            .mount(server)
            .await;
    }

    struct Fixture {
        dir: TempDir,
        history: Arc<HistoryStore>,
        catalog: Arc<Catalog>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let history = Arc::new(HistoryStore::open(dir.path().join(HISTORY_FILE)).unwrap());
            let catalog = Arc::new(Catalog::open(dir.path()).unwrap());
            Fixture { dir, history, catalog }
        }

        fn engine(&self, server: &MockServer, cfg: EngineConfig) -> DiscoveryEngine {
            let base = Url::parse(&format!("{}/index.php", server.uri())).unwrap();
            let opts = ProbeOptions { timeout: Duration::from_secs(5), ..ProbeOptions::default() };
            let probe = EndpointProbe::new(RequestShape::new(base, cfg.tag.clone()), Signature::default(), opts).unwrap();
            DiscoveryEngine::new(cfg, probe, self.history.clone(), self.catalog.clone())
        }
    }

    fn cfg(ports: &[u16]) -> EngineConfig {
        EngineConfig { static_ports: ports.to_vec(), run_timeout: None, ..EngineConfig::default() }
    }

    #[test]
    fn selection_filters_orders_and_truncates() {
        let page = [call("10.0.0.5"), call("61.1.1.1"), call("61.1.1.2"), call("61.1.1.3")].concat();
        let sel = select_hosts(&page, &EngineConfig { max_hosts: 2, ..EngineConfig::default() });
        assert_eq!(sel.hosts, vec![Ipv4Addr::new(61, 1, 1, 3), Ipv4Addr::new(61, 1, 1, 2)]);
        assert_eq!(sel.scan.internal.len(), 1);

        let cfg = EngineConfig { host_order: HostOrder::FirstSeenFirst, max_hosts: 2, ..EngineConfig::default() };
        assert_eq!(select_hosts(&page, &cfg).hosts, vec![Ipv4Addr::new(61, 1, 1, 1), Ipv4Addr::new(61, 1, 1, 2)]);
    }

    #[test]
    fn plain_hosts_are_merged_when_enabled() {
        let page = format!("{}<td>58.2.2.2</td>", call("61.1.1.1"));
        let cfg = EngineConfig { plain_hosts: true, host_order: HostOrder::FirstSeenFirst, ..EngineConfig::default() };
        assert_eq!(select_hosts(&page, &cfg).hosts, vec![Ipv4Addr::new(61, 1, 1, 1), Ipv4Addr::new(58, 2, 2, 2)]);
        assert_eq!(select_hosts(&page, &EngineConfig::default()).hosts.len(), 1);
    }

    #[test]
    fn host_order_parses() {
        assert_eq!("first-seen-first".parse::<HostOrder>(), Ok(HostOrder::FirstSeenFirst));
        assert!("random".parse::<HostOrder>().is_err());
    }

    #[tokio::test]
    async fn confirms_first_port_and_skips_private_hosts() {
        let server = MockServer::start().await;
        answer(&server, "88.1.2.3:8080", playlist(6), 1).await;
        answer(&server, "88.1.2.3:8082", playlist(6), 0).await;
        let fx = Fixture::new();
        let engine = fx.engine(&server, cfg(&[8080, 8082]));

        let page = format!("{}{}", call("10.0.0.5"), call("88.1.2.3"));
        let report = engine.run(&page, &CancellationToken::new()).await.unwrap();

        assert_eq!(report.hosts.len(), 1);
        assert_eq!(report.non_routable, 1);
        let HostState::Hit { port, label, origin, probes, artifact } = &report.hosts[0].state else {
            panic!("expected hit, got {:?}", report.hosts[0]);
        };
        assert_eq!((*port, label.as_str(), *origin, *probes), (8080, "湖北电信", Origin::StaticList, 1));
        assert_eq!(artifact.file_name().unwrap().to_str(), Some("湖北电信-88.1.2.3-8080.m3u"));
        assert_eq!(fs::read_to_string(artifact).unwrap(), playlist(6));
        assert!(fx.history.contains("88.1.2.3:8080".parse().unwrap()));
        assert_eq!(fx.history.len(), 1);
    }

    #[tokio::test]
    async fn first_hit_wins() {
        let server = MockServer::start().await;
        answer(&server, "88.1.2.3:8080", playlist(7), 1).await;
        answer(&server, "88.1.2.3:8082", playlist(7), 0).await;
        answer(&server, "88.1.2.3:8090", playlist(7), 0).await;
        let fx = Fixture::new();
        let engine = fx.engine(&server, cfg(&[8080, 8082, 8090]));

        engine.run(&call("88.1.2.3"), &CancellationToken::new()).await.unwrap();
        assert_eq!(fx.history.ports_for(HOST), vec![8080]);
        assert_eq!(fx.catalog.entries().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_run_probes_nothing() {
        let server = MockServer::start().await;
        answer(&server, "88.1.2.3:8080", playlist(6), 1).await;
        let fx = Fixture::new();
        let engine = fx.engine(&server, cfg(&[8080, 8082]));
        let page = call("88.1.2.3");

        engine.run(&page, &CancellationToken::new()).await.unwrap();
        let before = fs::read_to_string(fx.dir.path().join(HISTORY_FILE)).unwrap();
        let again = engine.run(&page, &CancellationToken::new()).await.unwrap();

        assert_eq!(again.probes(), 0);
        assert_eq!(again.hosts[0].state, HostState::Skipped { confirmed: vec![8080] });
        assert_eq!(fs::read_to_string(fx.dir.path().join(HISTORY_FILE)).unwrap(), before);
    }

    #[tokio::test]
    async fn confirmed_ports_are_not_reprobed() {
        let server = MockServer::start().await;
        answer(&server, "88.1.2.3:8080", playlist(6), 0).await;
        answer(&server, "88.1.2.3:8082", playlist(6), 1).await;
        let fx = Fixture::new();
        fx.history.record("88.1.2.3:8080".parse().unwrap()).unwrap();
        let engine = fx.engine(&server, EngineConfig { ports_per_host: 2, ..cfg(&[8080, 8082]) });

        let report = engine.run(&call("88.1.2.3"), &CancellationToken::new()).await.unwrap();
        assert_eq!(report.probes(), 1);
        assert_eq!(fx.history.ports_for(HOST), vec![8080, 8082]);
    }

    #[tokio::test]
    async fn exhausted_host_writes_nothing() {
        let server = MockServer::start().await;
        answer(&server, "88.1.2.3:8080", playlist(3), 1).await;
        let fx = Fixture::new();
        let engine = fx.engine(&server, cfg(&[8080, 8082]));

        let report = engine.run(&call("88.1.2.3"), &CancellationToken::new()).await.unwrap();
        assert_eq!(report.hosts[0].state, HostState::Exhausted { probes: 2, interrupted: false });
        assert!(fx.history.is_empty());
        assert!(fx.catalog.entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn probe_budget_limits_candidates() {
        let server = MockServer::start().await;
        answer(&server, "88.1.2.3:8082", playlist(6), 0).await;
        let fx = Fixture::new();
        let engine = fx.engine(&server, EngineConfig { probe_budget: Some(1), ..cfg(&[8080, 8082]) });

        let report = engine.run(&call("88.1.2.3"), &CancellationToken::new()).await.unwrap();
        assert_eq!(report.hosts[0].state, HostState::Exhausted { probes: 1, interrupted: false });
    }

    #[tokio::test]
    async fn rotation_makes_host_eligible_again() {
        let server = MockServer::start().await;
        answer(&server, "88.1.2.3:8080", playlist(6), 2).await;
        let fx = Fixture::new();
        let engine = fx.engine(&server, cfg(&[8080]));
        let page = call("88.1.2.3");

        let first = engine.run_at(&page, datetime!(2026-10-18 22:00 UTC), &CancellationToken::new()).await.unwrap();
        assert!(!first.rotated);
        let second = engine.run_at(&page, datetime!(2026-10-19 06:00 UTC), &CancellationToken::new()).await.unwrap();
        assert!(second.rotated);
        assert_eq!(second.hits().count(), 1);
        assert_eq!(fx.catalog.entries().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lookup_hints_come_first() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/result"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<td>88.1.2.3:4022</td>"))
            .expect(1)
            .mount(&server)
            .await;
        answer(&server, "88.1.2.3:4022", playlist(6), 1).await;
        answer(&server, "88.1.2.3:8080", playlist(6), 0).await;
        let fx = Fixture::new();
        let lookup = PortLookup::new(LookupOptions::new(Url::parse(&format!("{}/result", server.uri())).unwrap())).unwrap();
        let engine = fx.engine(&server, cfg(&[8080])).with_lookup(lookup, Pacing::Off);

        let report = engine.run(&call("88.1.2.3"), &CancellationToken::new()).await.unwrap();
        let HostState::Hit { port, origin, .. } = &report.hosts[0].state else { panic!("expected hit") };
        assert_eq!((*port, *origin), (4022, Origin::ExternalLookup));
        assert!(!report.lookup_blocked);
    }

    #[tokio::test]
    async fn blocked_lookup_falls_back_to_static_ports() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/result"))
            .respond_with(ResponseTemplate::new(429))
            .expect(1)
            .mount(&server)
            .await;
        for host in ["61.1.1.1", "61.1.1.2", "61.1.1.3"] {
            answer(&server, &format!("{host}:8080"), playlist(6), 1).await;
        }
        let fx = Fixture::new();
        let lookup = PortLookup::new(LookupOptions::new(Url::parse(&format!("{}/result", server.uri())).unwrap())).unwrap();
        let engine = fx.engine(&server, EngineConfig { concurrency: 1, ..cfg(&[8080]) }).with_lookup(lookup, Pacing::Off);

        let page = [call("61.1.1.1"), call("61.1.1.2"), call("61.1.1.3")].concat();
        let report = engine.run(&page, &CancellationToken::new()).await.unwrap();
        assert!(report.lookup_blocked);
        assert_eq!(report.hits().count(), 3);
        for h in report.hits() {
            let HostState::Hit { origin, .. } = &h.state else { unreachable!() };
            assert_eq!(*origin, Origin::StaticList);
        }
    }

    #[tokio::test]
    async fn failed_artifact_write_releases_claim() {
        let server = MockServer::start().await;
        answer(&server, "88.1.2.3:8080", playlist(6), 1).await;
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("playlists");
        let history = Arc::new(HistoryStore::open(dir.path().join(HISTORY_FILE)).unwrap());
        let catalog = Arc::new(Catalog::open(&store).unwrap());
        let fx = Fixture { dir, history, catalog };
        let engine = fx.engine(&server, cfg(&[8080]));
        fs::remove_dir_all(&store).unwrap();

        let err = engine.run(&call("88.1.2.3"), &CancellationToken::new()).await.unwrap_err();
        assert!(format!("{err:#}").contains("writing artifact for 88.1.2.3:8080"), "{err:#}");
        assert!(fx.history.is_empty());
        assert!(!fx.history.contains("88.1.2.3:8080".parse().unwrap()));
    }

    #[tokio::test]
    async fn non_utf8_playlist_is_stored_byte_for_byte() {
        let body = [playlist(6).as_bytes(), &[0xba, 0xfe, 0xb1, 0xb1, 0xff, b'\n']].concat();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.php"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;
        let fx = Fixture::new();
        let engine = fx.engine(&server, cfg(&[8080]));

        let report = engine.run(&call("88.1.2.3"), &CancellationToken::new()).await.unwrap();
        let HostState::Hit { label, artifact, .. } = &report.hosts[0].state else { panic!("expected hit") };
        assert_eq!(label, "湖北电信");
        assert_eq!(fs::read(artifact).unwrap(), body);
    }

    #[tokio::test]
    async fn deadline_interrupts_without_writing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.php"))
            .respond_with(ResponseTemplate::new(200).set_body_string(playlist(6)).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;
        let fx = Fixture::new();
        let engine = fx.engine(
            &server,
            EngineConfig { run_timeout: Some(Duration::from_millis(200)), ..cfg(&[8080, 8082]) },
        );

        let report = engine.run(&call("88.1.2.3"), &CancellationToken::new()).await.unwrap();
        assert!(report.interrupted);
        assert_eq!(report.hosts[0].state, HostState::Exhausted { probes: 1, interrupted: true });
        assert!(fx.history.is_empty());
        assert!(fx.catalog.entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_run_starts_no_probes() {
        let server = MockServer::start().await;
        answer(&server, "88.1.2.3:8080", playlist(6), 0).await;
        let fx = Fixture::new();
        let engine = fx.engine(&server, cfg(&[8080]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = engine.run(&call("88.1.2.3"), &cancel).await.unwrap();
        assert_eq!(report.hosts[0].state, HostState::Exhausted { probes: 0, interrupted: true });
    }

    #[tokio::test]
    async fn reports_follow_selection_order() {
        let server = MockServer::start().await;
        answer(&server, "61.1.1.1:8080", playlist(6), 1).await;
        answer(&server, "61.1.1.3:8080", playlist(6), 1).await;
        let fx = Fixture::new();
        let engine = fx.engine(&server, EngineConfig { concurrency: 3, ..cfg(&[8080]) });

        let page = [call("61.1.1.1"), call("61.1.1.2"), call("61.1.1.3")].concat();
        let report = engine.run(&page, &CancellationToken::new()).await.unwrap();
        let order: Vec<_> = report.hosts.iter().map(|h| (h.host.octets()[3], h.state.name())).collect();
        assert_eq!(order, vec![(3, "hit"), (2, "exhausted"), (1, "hit")]);
    }
}
