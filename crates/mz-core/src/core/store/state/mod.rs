//! Per-build-root record of what the materializer last wrote at each path.
//!
//! Reads always hit the in-memory map. In durable mode every mutation is
//! written through to SQLite first, so the map never holds an entry the
//! database would lose on restart. Access times are the exception: they are
//! buffered and flushed in batches.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Result;
use mz_domain::{ArtifactPath, MaterializedEntry};
use thiserror::Error;
use tracing::{debug, trace};

use crate::core::config::MaterializationMethod;
use crate::core::tooling::diagnostics;

mod index;


use index::StateDb;

pub(crate) const SCHEMA_VERSION: u32 = 2;
pub(crate) const MZ_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("[MZ811] materializer state is corrupt: {0}")]
    Corrupt(String),
    #[error("[MZ812] materializer state is missing required key '{0}'")]
    MissingMeta(String),
    #[error("[MZ812] materializer state incompatible for {key}: expected {expected}, found {found}")]
    IncompatibleFormat {
        key: String,
        expected: String,
        found: String,
    },
    #[error("[MZ810] materializer state write failed: {0}")]
    WriteFailure(String),
}

impl StoreError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Corrupt(_) => diagnostics::state::CORRUPT,
            Self::MissingMeta(_) | Self::IncompatibleFormat { .. } => {
                diagnostics::state::FORMAT_INCOMPATIBLE
            }
            Self::WriteFailure(_) => diagnostics::state::WRITE_FAILURE,
        }
    }
}

fn write_failure(err: anyhow::Error) -> anyhow::Error {
    if err.is::<StoreError>() {
        err
    } else {
        StoreError::WriteFailure(format!("{err:#}")).into()
    }
}

/// Values a durable store must have been written with to be reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateMeta {
    pub state_version: u32,
    pub materializations: MaterializationMethod,
}

pub struct StateStore {
    entries: RwLock<HashMap<ArtifactPath, MaterializedEntry>>,
    db: Option<Mutex<StateDb>>,
    pending_access: Mutex<BTreeMap<ArtifactPath, u64>>,
    flush_threshold: usize,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("entries", &self.len())
            .field("durable", &self.is_durable())
            .finish_non_exhaustive()
    }
}

impl StateStore {
    #[must_use]
    pub fn in_memory(flush_threshold: usize) -> Self {
        Self {
            entries: RwLock::default(),
            db: None,
            pending_access: Mutex::default(),
            flush_threshold,
        }
    }

    /// Opens the durable file without validating or loading it.
    ///
    /// Startup follows this with [`StateStore::validate`] and then either
    /// [`StateStore::load`] or [`StateStore::reset`].
    pub(crate) fn open_durable(path: &Path, meta: StateMeta, flush_threshold: usize) -> Result<Self> {
        let db = StateDb::open(path, meta)?;
        Ok(Self {
            entries: RwLock::default(),
            db: Some(Mutex::new(db)),
            pending_access: Mutex::default(),
            flush_threshold,
        })
    }

    #[must_use]
    pub fn is_durable(&self) -> bool {
        self.db.is_some()
    }

    #[must_use]
    pub fn db_path(&self) -> Option<PathBuf> {
        self.db.as_ref().map(|db| lock(db).path().to_path_buf())
    }

    /// Checks integrity, tables and recorded versions of the durable file.
    pub(crate) fn validate(&self) -> Result<()> {
        match &self.db {
            Some(db) => lock(db).validate(),
            None => Ok(()),
        }
    }

    /// Loads every decodable row into memory. Rows that fail to decode are
    /// deleted and reported as skipped.
    pub(crate) fn load(&self) -> Result<LoadSummary> {
        let Some(db) = &self.db else {
            return Ok(LoadSummary::default());
        };
        let mut db = lock(db);
        let loaded = db.load_entries()?;
        if !loaded.rejected.is_empty() {
            db.delete_rows(&loaded.rejected)?;
        }
        db.record_last_used()?;
        let summary = LoadSummary {
            loaded: loaded.entries.len(),
            skipped: loaded.rejected.len(),
        };
        let mut entries = self.write_entries();
        entries.clear();
        for entry in loaded.entries {
            entries.insert(entry.path.clone(), entry);
        }
        Ok(summary)
    }

    /// Drops every entry and recreates the durable file from scratch.
    pub(crate) fn reset(&self) -> Result<()> {
        if let Some(db) = &self.db {
            lock(db).recreate()?;
        }
        self.write_entries().clear();
        lock(&self.pending_access).clear();
        debug!(durable = self.is_durable(), "materializer state reset");
        Ok(())
    }

    #[must_use]
    pub fn get(&self, path: &ArtifactPath) -> Option<MaterializedEntry> {
        self.read_entries().get(path).cloned()
    }

    #[must_use]
    pub fn contains(&self, path: &ArtifactPath) -> bool {
        self.read_entries().contains_key(path)
    }

    /// Inserts or replaces the entry for `entry.path`.
    pub fn put(&self, entry: MaterializedEntry) -> Result<()> {
        if let Some(db) = &self.db {
            lock(db).upsert(&entry).map_err(write_failure)?;
        }
        trace!(path = %entry.path, digest = %entry.identity.digest(), "state put");
        lock(&self.pending_access).remove(&entry.path);
        self.write_entries().insert(entry.path.clone(), entry);
        Ok(())
    }

    pub fn remove(&self, path: &ArtifactPath) -> Result<Option<MaterializedEntry>> {
        if let Some(db) = &self.db {
            lock(db).delete(path).map_err(write_failure)?;
        }
        lock(&self.pending_access).remove(path);
        Ok(self.write_entries().remove(path))
    }

    /// Replaces the recorded deps of an existing entry. Returns `false` when
    /// the path is not tracked.
    pub fn update_deps(&self, path: &ArtifactPath, deps: BTreeSet<ArtifactPath>, now: u64) -> Result<bool> {
        if !self.contains(path) {
            return Ok(false);
        }
        if let Some(db) = &self.db {
            lock(db).update_deps(path, &deps, now).map_err(write_failure)?;
        }
        let mut entries = self.write_entries();
        let Some(entry) = entries.get_mut(path) else {
            return Ok(false);
        };
        entry.deps = deps;
        entry.stamp.last_accessed = now;
        lock(&self.pending_access).remove(path);
        Ok(true)
    }

    /// Records an access; durable writes are deferred until the batch fills
    /// up or [`StateStore::flush`] runs.
    pub fn touch(&self, path: &ArtifactPath, now: u64) -> Result<()> {
        {
            let mut entries = self.write_entries();
            let Some(entry) = entries.get_mut(path) else {
                return Ok(());
            };
            entry.stamp.last_accessed = now;
        }
        if self.db.is_none() {
            return Ok(());
        }
        let pending = {
            let mut pending = lock(&self.pending_access);
            pending.insert(path.clone(), now);
            pending.len()
        };
        if pending >= self.flush_threshold.max(1) {
            self.flush()?;
        }
        Ok(())
    }

    /// Writes buffered access times. Returns how many rows were updated.
    pub fn flush(&self) -> Result<usize> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let batch = std::mem::take(&mut *lock(&self.pending_access));
        if batch.is_empty() {
            return Ok(0);
        }
        let updated = lock(db).update_access_times(&batch).map_err(write_failure)?;
        debug!(updated, "flushed access times");
        Ok(updated)
    }

    #[must_use]
    pub fn pending_access_count(&self) -> usize {
        lock(&self.pending_access).len()
    }

    /// Snapshot of every entry, ordered by path.
    #[must_use]
    pub fn entries(&self) -> Vec<MaterializedEntry> {
        let mut out: Vec<_> = self.read_entries().values().cloned().collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tracked paths strictly above or below `path`.
    #[must_use]
    pub fn paths_overlapping(&self, path: &ArtifactPath) -> Vec<ArtifactPath> {
        let mut out: Vec<_> = self
            .read_entries()
            .keys()
            .filter(|other| *other != path && (other.starts_with(path) || path.starts_with(other)))
            .cloned()
            .collect();
        out.sort();
        out
    }

    fn read_entries(&self) -> RwLockReadGuard<'_, HashMap<ArtifactPath, MaterializedEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, HashMap<ArtifactPath, MaterializedEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub loaded: usize,
    pub skipped: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
