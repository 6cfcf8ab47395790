//! External port-intelligence lookup.
//!
//! The service is shared and rate limited: once it answers with a block (HTTP 429 or a challenge
//! page) no caller may query it again for the lifetime of the `PortLookup`.

use anyhow::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use castscan_core::pick_user_agent;
use regex::Regex;
use reqwest::{header, Client, StatusCode};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_LOOKUP_URL: &str = "https://fofa.info/result";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    Ports(Vec<u16>),
    /// This host's lookup failed; other hosts may still query.
    Unavailable,
    /// The service signalled a rate limit or challenge.
    Blocked,
}

impl LookupOutcome {
    pub fn ports(&self) -> &[u16] {
        match self {
            LookupOutcome::Ports(p) => p,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone)]
pub struct LookupOptions {
    pub base_url: Url,
    pub timeout: Duration,
    pub user_agents: Vec<String>,
    pub referer: Option<String>,
    pub block_markers: Vec<String>,
    /// Ports never worth probing for playlists.
    pub excluded: Vec<u16>,
}

impl LookupOptions {
    pub fn new(base_url: Url) -> Self {
        LookupOptions {
            base_url,
            timeout: Duration::from_secs(15),
            user_agents: Vec::new(),
            referer: Some("https://fofa.info/".into()),
            block_markers: ["captcha", "challenge", "too many requests", "访问频率"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            excluded: vec![22, 23, 53, 80, 443, 3306, 3389],
        }
    }
}

pub struct PortLookup {
    client: Client,
    opts: LookupOptions,
    blocked: AtomicBool,
}

impl PortLookup {
    pub fn new(opts: LookupOptions) -> Result<Self> {
        let client = Client::builder().timeout(opts.timeout).gzip(true).brotli(true).build()?;
        Ok(PortLookup { client, opts, blocked: AtomicBool::new(false) })
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    pub fn query_url(&self, host: Ipv4Addr) -> Url {
        let mut url = self.opts.base_url.clone();
        url.query_pairs_mut().append_pair("qbase64", &STANDARD.encode(host.to_string()));
        url
    }

    /// Query the service for ports it has seen open on `host`.
    pub async fn lookup(&self, host: Ipv4Addr) -> LookupOutcome {
        if self.is_blocked() {
            return LookupOutcome::Blocked;
        }
        let mut req = self
            .client
            .get(self.query_url(host))
            .header(header::USER_AGENT, pick_user_agent(&self.opts.user_agents));
        if let Some(r) = &self.opts.referer {
            req = req.header(header::REFERER, r);
        }
        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(%host, error = %e, "port lookup failed");
                return LookupOutcome::Unavailable;
            }
        };
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if is_block_signal(status, &body, &self.opts.block_markers) {
            if !self.blocked.swap(true, Ordering::AcqRel) {
                warn!(%host, status = status.as_u16(), "port lookup blocked; using static ports for the rest of the run");
            }
            return LookupOutcome::Blocked;
        }
        if !status.is_success() {
            debug!(%host, status = status.as_u16(), "port lookup returned non-success");
            return LookupOutcome::Unavailable;
        }
        let ports = extract_ports(&body, host, &self.opts.excluded);
        debug!(%host, count = ports.len(), "port lookup hints");
        LookupOutcome::Ports(ports)
    }
}

/// HTTP 429 or a body carrying any challenge marker (case-insensitive).
pub fn is_block_signal(status: StatusCode, body: &str, markers: &[String]) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    let lower = body.to_lowercase();
    markers.iter().any(|m| !m.is_empty() && lower.contains(&m.to_lowercase()))
}

fn port_item() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)port-item.*?(\d+)</a>").expect("static regex"))
}

/// Ports mentioned for `host` in a lookup response, ascending and unique.
pub fn extract_ports(body: &str, host: Ipv4Addr, excluded: &[u16]) -> Vec<u16> {
    let mut found = BTreeSet::new();
    let pattern = format!(r"(?:^|[^\d.]){}:(\d{{1,5}})\b", regex::escape(&host.to_string()));
    if let Ok(re) = Regex::new(&pattern) {
        found.extend(re.captures_iter(body).filter_map(|c| c.get(1)?.as_str().parse::<u16>().ok()));
    }
    found.extend(port_item().captures_iter(body).filter_map(|c| c.get(1)?.as_str().parse::<u16>().ok()));
    found.into_iter().filter(|p| *p != 0 && !excluded.contains(p)).collect()
}
