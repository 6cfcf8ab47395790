//! Core types and shared policy for the castscan engine.

pub mod pacing;

use rand::seq::SliceRandom;
use serde::Serialize;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

pub use pacing::Pacing;

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Browser User-Agent strings rotated across outbound requests.
pub const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
];

pub fn default_user_agents() -> Vec<String> {
    DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect()
}

/// Pick a User-Agent from `pool`, falling back to the built-in list when it is empty.
pub fn pick_user_agent(pool: &[String]) -> String {
    let mut rng = rand::thread_rng();
    match pool.choose(&mut rng) {
        Some(ua) => ua.clone(),
        None => DEFAULT_USER_AGENTS.choose(&mut rng).copied().unwrap_or_default().to_string(),
    }
}

/// Where a candidate port came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    StaticList,
    ExternalLookup,
    PageHint,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Origin::StaticList => "static",
            Origin::ExternalLookup => "lookup",
            Origin::PageHint => "page",
        };
        f.write_str(s)
    }
}

/// A not-yet-validated host:port pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub addr: SocketAddrV4,
    pub origin: Origin,
}

impl Candidate {
    pub fn new(host: Ipv4Addr, port: u16, origin: Origin) -> Self {
        Candidate { addr: SocketAddrV4::new(host, port), origin }
    }

    pub fn host(&self) -> Ipv4Addr {
        *self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}
