use crate::error::{io_err, Result};
use crate::rotation::RotationPeriod;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Default history file name inside a store directory.
pub const HISTORY_FILE: &str = "history.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryRecord {
    pub addr: SocketAddrV4,
    /// For records loaded from disk, the file's modification time.
    pub confirmed_at: OffsetDateTime,
}

/// Set of confirmed endpoints persisted as one `host:port` line each.
///
/// Every mutation reaches disk before the in-memory view changes, so a failed write leaves
/// both sides agreeing. Appends are synced; rewrites go through a temp file and a rename.
/// A sidecar `<file>.epoch` keeps the unix start of the period the entries belong to.
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    epoch_path: PathBuf,
    records: Mutex<BTreeMap<SocketAddrV4, OffsetDateTime>>,
}

impl HistoryStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err("create directory", parent))?;
        }
        let mut epoch_path = path.clone().into_os_string();
        epoch_path.push(".epoch");

        let (records, torn) = load(&path)?;
        let store = HistoryStore { path, epoch_path: PathBuf::from(epoch_path), records: Mutex::new(records) };
        if torn {
            // a partial trailing line would swallow the next append
            let state = store.lock();
            store.rewrite(state.keys())?;
        }
        debug!(path = %store.path.display(), records = store.len(), "history loaded");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<SocketAddrV4, OffsetDateTime>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, addr: SocketAddrV4) -> bool {
        self.lock().contains_key(&addr)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Confirmed ports of `host`, ascending.
    pub fn ports_for(&self, host: Ipv4Addr) -> Vec<u16> {
        self.lock().keys().filter(|a| *a.ip() == host).map(|a| a.port()).collect()
    }

    pub fn records(&self) -> Vec<HistoryRecord> {
        self.lock()
            .iter()
            .map(|(addr, at)| HistoryRecord { addr: *addr, confirmed_at: *at })
            .collect()
    }

    /// Claim `addr`. Returns `false` when it was already present, which makes the call safe
    /// to race between workers: exactly one of them sees `true`.
    pub fn record(&self, addr: SocketAddrV4) -> Result<bool> {
        let mut state = self.lock();
        if state.contains_key(&addr) {
            return Ok(false);
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err("open", &self.path))?;
        file.write_all(format!("{addr}\n").as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(io_err("append to", &self.path))?;
        state.insert(addr, OffsetDateTime::now_utc());
        Ok(true)
    }

    pub fn evict(&self, addr: SocketAddrV4) -> Result<bool> {
        let mut state = self.lock();
        if !state.contains_key(&addr) {
            return Ok(false);
        }
        self.rewrite(state.keys().filter(|a| **a != addr))?;
        state.remove(&addr);
        Ok(true)
    }

    /// Remove every record of `host`; returns how many went.
    pub fn evict_host(&self, host: Ipv4Addr) -> Result<usize> {
        let mut state = self.lock();
        let before = state.len();
        let doomed = state.keys().filter(|a| *a.ip() == host).count();
        if doomed == 0 {
            return Ok(0);
        }
        self.rewrite(state.keys().filter(|a| *a.ip() != host))?;
        state.retain(|a, _| *a.ip() != host);
        Ok(before - state.len())
    }

    /// Clear the history when `now` lies in a later period than the stored one.
    ///
    /// The stored period comes from the epoch sidecar, or from the history file's mtime when
    /// the sidecar is missing. With neither present the current period is stamped and nothing
    /// is cleared. A stored period later than `now` (clock moved back) is left alone.
    pub fn rotate_if_boundary_crossed(&self, now: OffsetDateTime, period: RotationPeriod) -> Result<bool> {
        if period == RotationPeriod::Never {
            return Ok(false);
        }
        let mut state = self.lock();
        let current = period.epoch_start(now);
        let marker = self.read_epoch();
        let stored = match marker {
            Some(e) => Some(e),
            None => self.file_epoch(period)?,
        };
        match stored {
            Some(e) if e < current => {
                self.rewrite(std::iter::empty())?;
                let cleared = state.len();
                state.clear();
                self.write_epoch(current)?;
                info!(cleared, %period, "history rotated");
                Ok(true)
            }
            _ => {
                if marker.is_none() {
                    self.write_epoch(stored.unwrap_or(current).max(current))?;
                }
                Ok(false)
            }
        }
    }

    fn read_epoch(&self) -> Option<i64> {
        let raw = match fs::read_to_string(&self.epoch_path) {
            Ok(s) => s,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %self.epoch_path.display(), error = %e, "epoch marker unreadable");
                }
                return None;
            }
        };
        match raw.trim().parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(path = %self.epoch_path.display(), "epoch marker malformed");
                None
            }
        }
    }

    fn file_epoch(&self, period: RotationPeriod) -> Result<Option<i64>> {
        match fs::metadata(&self.path) {
            Ok(meta) => {
                let modified = meta.modified().map_err(io_err("stat", &self.path))?;
                Ok(Some(period.epoch_start(OffsetDateTime::from(modified))))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err("stat", &self.path)(e)),
        }
    }

    fn write_epoch(&self, epoch: i64) -> Result<()> {
        replace_file(&self.epoch_path, format!("{epoch}\n").as_bytes())
    }

    fn rewrite<'a>(&self, addrs: impl Iterator<Item = &'a SocketAddrV4>) -> Result<()> {
        let body: String = addrs.map(|a| format!("{a}\n")).collect();
        replace_file(&self.path, body.as_bytes())
    }
}

/// Parse the history file. The flag reports a trailing line without its newline.
fn load(path: &Path) -> Result<(BTreeMap<SocketAddrV4, OffsetDateTime>, bool)> {
    let raw = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((BTreeMap::new(), false)),
        Err(e) => return Err(io_err("read", path)(e)),
    };
    let stamp = fs::metadata(path)
        .and_then(|m| m.modified())
        .map(OffsetDateTime::from)
        .unwrap_or_else(|_| OffsetDateTime::now_utc());
    let torn = !raw.is_empty() && !raw.ends_with('\n');

    let mut records = BTreeMap::new();
    for (i, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.parse::<SocketAddrV4>() {
            Ok(addr) => {
                records.insert(addr, stamp);
            }
            Err(_) => warn!(path = %path.display(), line = i + 1, "skipping malformed history line"),
        }
    }
    Ok((records, torn))
}

fn replace_file(path: &Path, body: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err("create temp file in", dir))?;
    tmp.write_all(body)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(io_err("write", tmp.path()))?;
    tmp.persist(path).map_err(|e| io_err("replace", path)(e.error))?;
    Ok(())
}
