//! Candidate port planning: priority lists, external hints and page hints merged into one order.

pub mod lookup;

use anyhow::{anyhow, Result};
use castscan_core::{Candidate, Origin};
use std::collections::HashSet;
use std::net::Ipv4Addr;

pub use lookup::{LookupOptions, LookupOutcome, PortLookup, DEFAULT_LOOKUP_URL};

/// Parse a comma-separated list of ports/ranges (e.g., "8080,4000-4003").
/// Order is preserved; later duplicates are dropped.
pub fn parse_ports(spec: &str) -> Result<Vec<u16>> {
    let mut ports = Vec::new();
    for part in spec.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if let Some((start, end)) = part.split_once('-') {
            let s: u16 = start.trim().parse()?;
            let e: u16 = end.trim().parse()?;
            if s == 0 || e == 0 || s > e {
                return Err(anyhow!("invalid port range: {}", part));
            }
            ports.extend(s..=e);
        } else {
            let p: u16 = part.parse()?;
            if p == 0 {
                return Err(anyhow!("invalid port: {}", part));
            }
            ports.push(p);
        }
    }
    Ok(dedup_in_order(ports))
}

fn dedup_in_order(ports: impl IntoIterator<Item = u16>) -> Vec<u16> {
    let mut seen = HashSet::new();
    ports.into_iter().filter(|p| seen.insert(*p)).collect()
}

/// Default priority list of ports seen on multicast relay gateways.
pub fn default_static_ports() -> Vec<u16> {
    const CURATED: &[u16] = &[
        6636, 16888, 5002, 3333, 8188, 8055, 8288, 8880, 5555, 55555, 58888, 7000, 7700, 6003,
        9988, 9999, 8012, 10000, 8888, 4022, 8022, 7777, 5146, 5140, 4056, 12320, 8080, 8000,
        9901, 8090, 8181, 1234, 4000, 4001, 5148, 12345, 8805, 8187, 9926, 8222, 8808, 8883,
        8686, 4023, 8848, 6666, 9000, 9001, 888, 9003, 8082, 20443, 85, 8081, 8001, 8003, 6001,
        8899,
    ];
    dedup_in_order(CURATED.iter().copied())
}

/// Ordered candidates for `host`: external hints, then page hints, then the static list.
/// A port keeps the origin of its first occurrence.
pub fn plan_candidates(host: Ipv4Addr, external: &[u16], page: &[u16], static_ports: &[u16]) -> Vec<Candidate> {
    let mut seen = HashSet::new();
    let sources = [
        (external, Origin::ExternalLookup),
        (page, Origin::PageHint),
        (static_ports, Origin::StaticList),
    ];
    let mut out = Vec::with_capacity(external.len() + page.len() + static_ports.len());
    for (ports, origin) in sources {
        for &p in ports {
            if p != 0 && seen.insert(p) {
                out.push(Candidate::new(host, p, origin));
            }
        }
    }
    out
}
