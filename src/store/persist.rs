//! Write-behind full-state dump.
//!
//! Mutations only mark the dump dirty. The document is rewritten wholesale
//! when the flush interval has elapsed since the last write, on
//! [`WriteBehind::flush`], and on shutdown. Anything mutated after the last
//! flush and not covered by the WAL (usage stats) is lost on a crash; that
//! window is bounded by the flush interval.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::StoreResult;
use crate::error::StoreError;

/// Debounced writer for the full-state document.
#[derive(Debug)]
pub struct WriteBehind {
    path: Option<PathBuf>,
    interval: Duration,
    dirty: bool,
    last_flush: Instant,
    flushes: u64,
}

impl WriteBehind {
    /// Writer that never touches disk.
    pub fn disabled() -> Self {
        Self {
            path: None,
            interval: Duration::ZERO,
            dirty: false,
            last_flush: Instant::now(),
            flushes: 0,
        }
    }

    pub fn new(path: PathBuf, interval: Duration) -> Self {
        Self {
            path: Some(path),
            interval,
            dirty: false,
            last_flush: Instant::now(),
            flushes: 0,
        }
    }

    /// Read the last flushed document, if any.
    pub fn load(path: &Path) -> StoreResult<Option<Vec<u8>>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io { source: e }),
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = self.path.is_some();
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether a dirty document has waited out the flush interval.
    pub fn is_due(&self) -> bool {
        self.dirty && self.last_flush.elapsed() >= self.interval
    }

    /// Number of completed flushes.
    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    /// Write `bytes` if dirty, via a temp file and rename.
    pub fn flush(&mut self, bytes: &[u8]) -> StoreResult<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        if !self.dirty {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io { source: e })?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes).map_err(|e| StoreError::Io { source: e })?;
        std::fs::rename(&tmp, path).map_err(|e| StoreError::Io { source: e })?;
        self.dirty = false;
        self.last_flush = Instant::now();
        self.flushes += 1;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "state dump flushed");
        Ok(true)
    }
}
