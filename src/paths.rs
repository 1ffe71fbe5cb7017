//! XDG-compliant path resolution for strata.
//!
//! Provides `StrataPaths` (global directories) and `DataLayout` (the files
//! inside one knowledge-base data directory) following the XDG Base
//! Directory Specification.

use std::path::{Path, PathBuf};

use miette::Diagnostic;
use thiserror::Error;

/// Errors from path resolution.
#[derive(Debug, Error, Diagnostic)]
pub enum PathError {
    #[error("cannot determine home directory")]
    #[diagnostic(
        code(strata::paths::no_home),
        help("Set the HOME environment variable or pass --data-dir explicitly.")
    )]
    NoHome,

    #[error("failed to create directory: {path}")]
    #[diagnostic(
        code(strata::paths::create_dir),
        help("Check that the parent directory exists and you have write permissions.")
    )]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type PathResult<T> = std::result::Result<T, PathError>;

/// Global XDG-compliant directories for strata.
#[derive(Debug, Clone)]
pub struct StrataPaths {
    /// `$XDG_CONFIG_HOME/strata/`
    pub config_dir: PathBuf,
    /// `$XDG_DATA_HOME/strata/`
    pub data_dir: PathBuf,
}

impl StrataPaths {
    /// Resolve XDG directories from environment variables with standard fallbacks.
    pub fn resolve() -> PathResult<Self> {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .map_err(|_| PathError::NoHome)?;

        let config_dir = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".config"))
            .join("strata");

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".local/share"))
            .join("strata");

        Ok(Self {
            config_dir,
            data_dir,
        })
    }

    /// Path to the global config file.
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Layout of the default knowledge base.
    pub fn default_layout(&self) -> DataLayout {
        DataLayout::new(self.data_dir.join("kb"))
    }
}

/// Files inside one knowledge-base data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    /// The data directory itself; also holds `log.redb` (WAL + audit trail).
    pub root: PathBuf,
    /// `root/state.json`: the write-behind full-state dump.
    pub state_file: PathBuf,
    /// `root/snapshots/`: pre-install captures.
    pub snapshot_dir: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            state_file: root.join("state.json"),
            snapshot_dir: root.join("snapshots"),
            root,
        }
    }

    /// Create the data and snapshot directories. Idempotent.
    pub fn ensure_dirs(&self) -> PathResult<()> {
        for dir in [&self.root, &self.snapshot_dir] {
            create_dir(dir)?;
        }
        Ok(())
    }

    /// Whether a knowledge base has been flushed here before.
    pub fn exists(&self) -> bool {
        self.state_file.is_file()
    }
}

fn create_dir(dir: &Path) -> PathResult<()> {
    std::fs::create_dir_all(dir).map_err(|e| PathError::CreateDir {
        path: dir.display().to_string(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_paths_are_namespaced() {
        let paths = StrataPaths::resolve().unwrap();
        assert!(paths.config_dir.ends_with("strata"));
        assert!(paths.data_dir.ends_with("strata"));
        assert!(paths.default_layout().root.starts_with(&paths.data_dir));
    }

    #[test]
    fn layout_derives_from_root() {
        let layout = DataLayout::new("/data/strata/kb");
        assert_eq!(layout.state_file, PathBuf::from("/data/strata/kb/state.json"));
        assert_eq!(layout.snapshot_dir, PathBuf::from("/data/strata/kb/snapshots"));
    }

    #[test]
    fn ensure_dirs_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let layout = DataLayout::new(dir.path().join("kb"));
        layout.ensure_dirs().unwrap();
        layout.ensure_dirs().unwrap();
        assert!(layout.snapshot_dir.is_dir());
        assert!(!layout.exists());
    }
}
