//! Host extraction from fetched page text.
//!
//! Pages embed candidate hosts as `gotoIP('<base64>', '<tag>')` calls. Identifiers are decoded
//! one by one; a malformed identifier is recorded and skipped, never fatal.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use ipnet::Ipv4Net;
use regex::Regex;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::debug;

const IDENTIFIER: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("identifier `{0}` is not valid base64")]
    Encoding(String),
    #[error("identifier `{0}` does not decode to UTF-8")]
    Utf8(String),
    #[error("decoded value `{0}` is not a dotted-quad address")]
    NotDottedQuad(String),
}

/// Result of scanning one page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostScan {
    /// Routable hosts in order of first appearance.
    pub hosts: Vec<Ipv4Addr>,
    /// Identifiers that failed to decode.
    pub failures: Vec<DecodeError>,
    /// Decoded addresses dropped as non-routable.
    pub internal: Vec<Ipv4Addr>,
}

fn call_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"gotoIP\(\s*['"]([^'"]+)['"]\s*(?:,\s*['"]([^'"]*)['"]\s*)?\)"#)
            .expect("static regex")
    })
}

fn dotted_quad() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.(\d{1,3})$").expect("static regex"))
}

fn bare_quad() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("static regex"))
}

fn reserved_nets() -> &'static [Ipv4Net] {
    static NETS: OnceLock<Vec<Ipv4Net>> = OnceLock::new();
    NETS.get_or_init(|| {
        ["0.0.0.0/8", "100.64.0.0/10", "198.18.0.0/15", "240.0.0.0/4"]
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect()
    })
}

/// Parse a strict dotted-quad string (four decimal octets, each at most 255).
pub fn parse_dotted_quad(s: &str) -> Option<Ipv4Addr> {
    let caps = dotted_quad().captures(s)?;
    let mut octets = [0u8; 4];
    for (i, o) in octets.iter_mut().enumerate() {
        *o = caps.get(i + 1)?.as_str().parse().ok()?;
    }
    Some(Ipv4Addr::from(octets))
}

/// Decode one opaque identifier into an IPv4 host.
pub fn decode_identifier(raw: &str) -> Result<Ipv4Addr, DecodeError> {
    let trimmed = raw.trim();
    let bytes = IDENTIFIER
        .decode(trimmed)
        .map_err(|_| DecodeError::Encoding(trimmed.to_string()))?;
    let text = String::from_utf8(bytes).map_err(|_| DecodeError::Utf8(trimmed.to_string()))?;
    let text = text.trim();
    parse_dotted_quad(text).ok_or_else(|| DecodeError::NotDottedQuad(text.to_string()))
}

/// Whether an address can be a public relay host.
pub fn is_routable(ip: Ipv4Addr) -> bool {
    if ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
    {
        return false;
    }
    !reserved_nets().iter().any(|net| net.contains(&ip))
}

/// Scan `text` for `gotoIP` calls carrying `tag` and decode their identifiers.
pub fn scan_hosts(text: &str, tag: &str) -> HostScan {
    let mut scan = HostScan::default();
    let mut seen = HashSet::new();
    for caps in call_pattern().captures_iter(text) {
        let Some(call_tag) = caps.get(2).map(|m| m.as_str().trim()) else { continue };
        if call_tag != tag {
            continue;
        }
        let raw = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        match decode_identifier(raw) {
            Ok(ip) => admit(ip, &mut scan, &mut seen),
            Err(e) => {
                debug!(error = %e, "skipping identifier");
                scan.failures.push(e);
            }
        }
    }
    scan
}

/// Extract bare dotted-quad hosts (pages that carry addresses unobfuscated).
pub fn scan_plain_hosts(text: &str) -> HostScan {
    let mut scan = HostScan::default();
    let mut seen = HashSet::new();
    for m in bare_quad().find_iter(text) {
        if let Some(ip) = parse_dotted_quad(m.as_str()) {
            admit(ip, &mut scan, &mut seen);
        }
    }
    scan
}

fn admit(ip: Ipv4Addr, scan: &mut HostScan, seen: &mut HashSet<Ipv4Addr>) {
    if !seen.insert(ip) {
        return;
    }
    if is_routable(ip) {
        scan.hosts.push(ip);
    } else {
        scan.internal.push(ip);
    }
}

impl HostScan {
    /// Append hosts from `other` that are not already present.
    pub fn merge(&mut self, other: HostScan) {
        let mut seen: HashSet<Ipv4Addr> = self.hosts.iter().chain(self.internal.iter()).copied().collect();
        for ip in other.hosts {
            if seen.insert(ip) {
                self.hosts.push(ip);
            }
        }
        for ip in other.internal {
            if seen.insert(ip) {
                self.internal.push(ip);
            }
        }
        self.failures.extend(other.failures);
    }
}

/// Ports that appear next to `host` as `host:port` in the page, in order, unique.
pub fn page_hints(text: &str, host: Ipv4Addr) -> Vec<u16> {
    let pattern = format!(r"(?:^|[^\d.]){}:(\d{{1,5}})\b", regex::escape(&host.to_string()));
    let Ok(re) = Regex::new(&pattern) else { return Vec::new() };
    let mut ports = Vec::new();
    for caps in re.captures_iter(text) {
        if let Some(p) = caps.get(1).and_then(|m| m.as_str().parse::<u16>().ok()) {
            if p != 0 && !ports.contains(&p) {
                ports.push(p);
            }
        }
    }
    ports
}
