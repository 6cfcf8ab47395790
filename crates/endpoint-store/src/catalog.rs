use crate::error::{io_err, Result};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use tracing::{debug, warn};

pub const ARTIFACT_EXTENSION: &str = "m3u";

/// Identity of a stored playlist: `<label>-<host>-<port>.m3u`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub label: String,
    pub addr: SocketAddrV4,
}

impl ArtifactKey {
    pub fn new(label: impl Into<String>, addr: SocketAddrV4) -> Self {
        ArtifactKey { label: label.into(), addr }
    }

    pub fn file_name(&self) -> String {
        format!("{}-{}-{}.{ARTIFACT_EXTENSION}", self.label, self.addr.ip(), self.addr.port())
    }

    /// Parse a file name from the right, so labels may contain `-`. Hosts written with `_`
    /// separators are accepted too, as is the all-underscore `<label>_<a>_<b>_<c>_<d>_<port>`.
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(ARTIFACT_EXTENSION)?.strip_suffix('.')?;
        Self::parse_split(stem, '-', 3).or_else(|| Self::parse_split(stem, '_', 6))
    }

    fn parse_split(stem: &str, sep: char, n: usize) -> Option<Self> {
        let mut parts: Vec<&str> = stem.rsplitn(n, sep).collect();
        if parts.len() != n {
            return None;
        }
        let label = parts.pop().filter(|l| !l.is_empty())?;
        let port = parts.remove(0).parse::<u16>().ok()?;
        parts.reverse();
        let host = parts.join(".").replace('_', ".").parse::<Ipv4Addr>().ok()?;
        Some(ArtifactKey { label: label.to_string(), addr: SocketAddrV4::new(host, port) })
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.label, self.addr)
    }
}

#[derive(Debug, Clone)]
pub struct Artifact {
    pub key: ArtifactKey,
    /// Body exactly as served; relays answer in several encodings.
    pub payload: Vec<u8>,
    pub created_at: OffsetDateTime,
}

/// A playlist file in the catalog directory. `key` is `None` for names that do not parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub path: PathBuf,
    pub key: Option<ArtifactKey>,
}

impl CatalogEntry {
    pub fn file_name(&self) -> String {
        self.path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
    }
}

/// Directory of playlist artifacts, at most one per endpoint.
#[derive(Debug, Clone)]
pub struct Catalog {
    dir: PathBuf,
}

impl Catalog {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_err("create directory", &dir))?;
        Ok(Catalog { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All `.m3u` files, sorted by name.
    pub fn entries(&self) -> Result<Vec<CatalogEntry>> {
        let mut out = Vec::new();
        for item in fs::read_dir(&self.dir).map_err(io_err("list", &self.dir))? {
            let item = item.map_err(io_err("list", &self.dir))?;
            let path = item.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(ARTIFACT_EXTENSION) {
                continue;
            }
            let key = path.file_name().and_then(|n| n.to_str()).and_then(ArtifactKey::parse);
            if key.is_none() {
                warn!(path = %path.display(), "catalog file name does not parse");
            }
            out.push(CatalogEntry { path, key });
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    pub fn for_endpoint(&self, addr: SocketAddrV4) -> Result<Vec<CatalogEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.key.as_ref().is_some_and(|k| k.addr == addr))
            .collect())
    }

    /// Write atomically, replacing any other artifact of the same endpoint.
    pub fn write(&self, artifact: &Artifact) -> Result<PathBuf> {
        let target = self.dir.join(artifact.key.file_name());
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(io_err("create temp file in", &self.dir))?;
        tmp.write_all(&artifact.payload)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(io_err("write", tmp.path()))?;
        tmp.persist(&target).map_err(|e| io_err("replace", &target)(e.error))?;

        for stale in self.for_endpoint(artifact.key.addr)? {
            if stale.path != target {
                debug!(path = %stale.path.display(), "replacing older artifact");
                self.remove(&stale)?;
            }
        }
        Ok(target)
    }

    pub fn read(&self, entry: &CatalogEntry) -> Result<Vec<u8>> {
        fs::read(&entry.path).map_err(io_err("read", &entry.path))
    }

    /// Delete an entry. Already-gone files count as removed.
    pub fn remove(&self, entry: &CatalogEntry) -> Result<()> {
        match fs::remove_file(&entry.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err("remove", &entry.path)(e)),
        }
    }
}
