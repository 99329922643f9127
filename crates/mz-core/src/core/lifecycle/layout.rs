//! On-disk layout under `<build root>/mz-out`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use mz_domain::ArtifactPath;
use tracing::debug;
use walkdir::WalkDir;

use crate::core::fs::remove_path;

pub const OUT_DIR: &str = "mz-out";
pub const CACHE_DIR: &str = "cache";
pub const STATE_DIR: &str = "materializer_state";
pub const COMMAND_HASHES_DIR: &str = "command_hashes";
pub const STATE_DB_FILENAME: &str = "db.sqlite";
pub const CAS_DIR: &str = "cas";
pub const DAEMON_LOCK_FILENAME: &str = "daemon.lock";

/// Cache root holding `materializer_state/` while durable state is enabled
/// and `command_hashes/` while command hashing is enabled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheDirectoryLayout {
    build_root: PathBuf,
}

impl CacheDirectoryLayout {
    #[must_use]
    pub fn new(build_root: impl Into<PathBuf>) -> Self {
        Self {
            build_root: build_root.into(),
        }
    }

    #[must_use]
    pub fn build_root(&self) -> &Path {
        &self.build_root
    }

    #[must_use]
    pub fn out_dir(&self) -> PathBuf {
        self.build_root.join(OUT_DIR)
    }

    #[must_use]
    pub fn cache_root(&self) -> PathBuf {
        self.out_dir().join(CACHE_DIR)
    }

    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.cache_root().join(STATE_DIR)
    }

    #[must_use]
    pub fn state_db(&self) -> PathBuf {
        self.state_dir().join(STATE_DB_FILENAME)
    }

    #[must_use]
    pub fn command_hashes_dir(&self) -> PathBuf {
        self.cache_root().join(COMMAND_HASHES_DIR)
    }

    #[must_use]
    pub fn cas_root(&self) -> PathBuf {
        self.out_dir().join(CAS_DIR)
    }

    #[must_use]
    pub fn daemon_lock_path(&self) -> PathBuf {
        self.out_dir().join(DAEMON_LOCK_FILENAME)
    }

    /// Build-root-relative paths artifacts may never be written to.
    #[must_use]
    pub fn reserved_paths(&self) -> Vec<ArtifactPath> {
        [CACHE_DIR, CAS_DIR, DAEMON_LOCK_FILENAME]
            .iter()
            .filter_map(|name| ArtifactPath::new(format!("{OUT_DIR}/{name}")).ok())
            .collect()
    }

    /// Creates the subdirectories for enabled features and deletes the ones
    /// for disabled features.
    pub fn reconcile(&self, durable_state: bool, command_hashes: bool) -> Result<()> {
        let cache_root = self.cache_root();
        fs::create_dir_all(&cache_root)
            .with_context(|| format!("failed to create {}", cache_root.display()))?;
        for (dir, enabled) in [
            (self.state_dir(), durable_state),
            (self.command_hashes_dir(), command_hashes),
        ] {
            if enabled {
                fs::create_dir_all(&dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            } else if remove_path(&dir)? {
                debug!(dir = %dir.display(), "removed cache directory for disabled feature");
            }
        }
        Ok(())
    }

    /// Names directly under the cache root, sorted.
    pub fn cache_listing(&self) -> Result<Vec<String>> {
        let root = self.cache_root();
        let entries = match fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to list {}", root.display()))
            }
        };
        let mut names = Vec::new();
        for entry in entries {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    /// Bytes used by regular files under the cache root.
    #[must_use]
    pub fn cache_bytes(&self) -> u64 {
        WalkDir::new(self.cache_root())
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.metadata().ok())
            .map(|meta| meta.len())
            .sum()
    }
}
