//! Pre-install snapshots.
//!
//! A snapshot is the full encoded [`StoreState`](super::StoreState), captured
//! synchronously before every install attempt. Persistent snapshots are files
//! named `snapshot-<unix-millis>-<counter>.bin` under the snapshot directory;
//! memory-only snapshots are kept in process. File snapshots are retained
//! until [`SnapshotManager::prune`] is called by an operator. Each memory
//! snapshot is a full copy of the store, so only the newest
//! [`DEFAULT_MEMORY_RETENTION`] (or the configured cap) are kept; older ones
//! are dropped on capture and can no longer be restored.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::StoreResult;
use crate::error::StoreError;

/// Where a snapshot lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotRef {
    File(PathBuf),
    Memory(u64),
}

impl std::fmt::Display for SnapshotRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotRef::File(p) => write!(f, "{}", p.display()),
            SnapshotRef::Memory(n) => write!(f, "memory:{n}"),
        }
    }
}

impl std::str::FromStr for SnapshotRef {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(n) = s.strip_prefix("memory:").and_then(|n| n.parse().ok()) {
            return Ok(SnapshotRef::Memory(n));
        }
        Ok(SnapshotRef::File(PathBuf::from(s)))
    }
}

/// Memory snapshots kept by [`SnapshotManager::memory_only`].
pub const DEFAULT_MEMORY_RETENTION: usize = 64;

/// Captures and restores encoded store state.
#[derive(Debug)]
pub struct SnapshotManager {
    dir: Option<PathBuf>,
    memory: Vec<(u64, Vec<u8>)>,
    retain: usize,
    counter: u64,
}

impl SnapshotManager {
    pub fn memory_only() -> Self {
        Self {
            dir: None,
            memory: Vec::new(),
            retain: DEFAULT_MEMORY_RETENTION,
            counter: 0,
        }
    }

    /// Keep at most `retain` memory snapshots (at least one).
    pub fn with_memory_retention(mut self, retain: usize) -> Self {
        self.retain = retain.max(1);
        self
    }

    /// Snapshots written as files under `dir`.
    pub fn in_dir(dir: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(dir).map_err(|e| StoreError::Io { source: e })?;
        Ok(Self {
            dir: Some(dir.to_path_buf()),
            memory: Vec::new(),
            retain: DEFAULT_MEMORY_RETENTION,
            counter: 0,
        })
    }

    /// Persist `bytes` and return a reference to them. Files are synced
    /// before this returns.
    pub fn capture(&mut self, bytes: &[u8]) -> StoreResult<SnapshotRef> {
        self.counter += 1;
        let Some(dir) = &self.dir else {
            self.memory.push((self.counter, bytes.to_vec()));
            let excess = self.memory.len().saturating_sub(self.retain);
            if excess > 0 {
                self.memory.drain(..excess);
                tracing::debug!(dropped = excess, retain = self.retain, "snapshot: memory retention cap reached");
            }
            return Ok(SnapshotRef::Memory(self.counter));
        };
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let path = dir.join(format!("snapshot-{millis}-{:06}.bin", self.counter));
        let mut file = std::fs::File::create(&path).map_err(|e| StoreError::Io { source: e })?;
        file.write_all(bytes).map_err(|e| StoreError::Io { source: e })?;
        file.sync_all().map_err(|e| StoreError::Io { source: e })?;
        Ok(SnapshotRef::File(path))
    }

    /// Read back the bytes of a snapshot.
    pub fn load(&self, reference: &SnapshotRef) -> StoreResult<Vec<u8>> {
        match reference {
            SnapshotRef::Memory(n) => self
                .memory
                .iter()
                .find(|(id, _)| id == n)
                .map(|(_, bytes)| bytes.clone())
                .ok_or_else(|| StoreError::SnapshotMissing {
                    reference: reference.to_string(),
                }),
            SnapshotRef::File(path) => std::fs::read(path).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StoreError::SnapshotMissing {
                        reference: reference.to_string(),
                    }
                } else {
                    StoreError::Io { source: e }
                }
            }),
        }
    }

    /// All retained snapshots, oldest first.
    pub fn list(&self) -> StoreResult<Vec<SnapshotRef>> {
        let Some(dir) = &self.dir else {
            return Ok(self
                .memory
                .iter()
                .map(|(n, _)| SnapshotRef::Memory(*n))
                .collect());
        };
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| StoreError::Io { source: e })?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("snapshot-") && n.ends_with(".bin"))
            })
            .collect();
        paths.sort();
        Ok(paths.into_iter().map(SnapshotRef::File).collect())
    }

    /// Delete all but the newest `keep` snapshots. Returns how many were removed.
    pub fn prune(&mut self, keep: usize) -> StoreResult<usize> {
        let all = self.list()?;
        let excess = all.len().saturating_sub(keep);
        for reference in all.iter().take(excess) {
            match reference {
                SnapshotRef::Memory(n) => self.memory.retain(|(id, _)| id != n),
                SnapshotRef::File(path) => {
                    std::fs::remove_file(path).map_err(|e| StoreError::Io { source: e })?;
                }
            }
        }
        Ok(excess)
    }
}
