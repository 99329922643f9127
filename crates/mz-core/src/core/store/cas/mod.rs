//! Local content-addressable store backing materialization.
//!
//! Objects are raw file blobs keyed by their SHA-256 and laid out as
//! `objects/<2-hex shard>/<sha256>`. Writes land in `tmp/` first, are synced,
//! renamed into place and made read-only. Concurrent writers of the same
//! object serialize on a per-object lock file under `locks/`.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs4::FileExt;
use mz_domain::Digest;
use sha2::{Digest as _, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::tooling::diagnostics;

mod ingest;
mod objects;


const OBJECTS_DIR: &str = "objects";
const TMP_DIR: &str = "tmp";
const LOCKS_DIR: &str = "locks";
const PARTIAL_SUFFIX: &str = ".partial";
const COPY_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum CasError {
    #[error("[MZ800] content {digest} is missing from the content store")]
    MissingObject { digest: String },
    #[error("[MZ800] content {digest} is corrupt (found {actual})")]
    DigestMismatch { digest: String, actual: String },
    #[error("[MZ801] content store write failed: {0}")]
    WriteFailure(String),
}

impl CasError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingObject { .. } | Self::DigestMismatch { .. } => {
                diagnostics::cas::MISSING_OR_CORRUPT
            }
            Self::WriteFailure(_) => diagnostics::cas::STORE_WRITE_FAILURE,
        }
    }
}

fn write_error(err: anyhow::Error) -> anyhow::Error {
    if err.is::<CasError>() {
        err
    } else {
        CasError::WriteFailure(format!("{err:#}")).into()
    }
}

/// Handle to a content store rooted at a directory.
#[derive(Clone, Debug)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Opens (creating if needed) the store at `root` and clears stale partials.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { root: root.into() };
        store.ensure_layout()?;
        let swept = store.sweep_partials()?;
        if swept > 0 {
            debug!(root = %store.root.display(), swept, "removed stale content store partials");
        }
        Ok(store)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_layout(&self) -> Result<()> {
        for dir in [OBJECTS_DIR, LOCKS_DIR, TMP_DIR] {
            let path = self.root.join(dir);
            fs::create_dir_all(&path).with_context(|| {
                format!("failed to ensure content store directory {}", path.display())
            })?;
        }
        Ok(())
    }

    #[must_use]
    pub fn object_path(&self, digest: &Digest) -> PathBuf {
        let oid = digest.hash_hex();
        let shard = oid.get(0..2).unwrap_or("xx").to_string();
        self.root.join(OBJECTS_DIR).join(shard).join(oid)
    }

    fn lock_path(&self, oid: &str) -> PathBuf {
        self.root.join(LOCKS_DIR).join(format!("{oid}.lock"))
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    #[must_use]
    pub fn contains(&self, digest: &Digest) -> bool {
        fs::metadata(self.object_path(digest))
            .map(|meta| meta.is_file() && meta.len() == digest.size())
            .unwrap_or(false)
    }

    pub(crate) fn acquire_lock(&self, oid: &str) -> Result<File> {
        let path = self.lock_path(oid);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create content store lock directory {}", parent.display())
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("failed to open content store lock {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("failed to lock {}", path.display()))?;
        Ok(file)
    }

    /// Removes `*.partial` leftovers from interrupted writes.
    pub fn sweep_partials(&self) -> Result<usize> {
        let dir = self.tmp_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to list {}", dir.display()))
            }
        };
        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if !name.to_string_lossy().ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) => warn!(
                    path = %entry.path().display(),
                    error = %err,
                    "failed to remove stale partial"
                ),
            }
        }
        Ok(removed)
    }
}

/// Streams `reader` through SHA-256, returning the digest of everything read.
fn hash_reader(reader: &mut impl Read) -> Result<Digest> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut size = 0u64;
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        size += read as u64;
    }
    Ok(Digest::from_sha256(hasher.finalize().into(), size))
}

fn remove_write_permissions(path: &Path) -> Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = perms.mode();
        let new_mode = mode & !0o222;
        if mode != new_mode {
            perms.set_mode(new_mode);
            fs::set_permissions(path, perms)?;
        }
    }
    #[cfg(not(unix))]
    {
        if !perms.readonly() {
            perms.set_readonly(true);
            fs::set_permissions(path, perms)?;
        }
    }
    Ok(())
}
