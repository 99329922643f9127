use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mz_domain::{ArtifactIdentity, ArtifactPath, MaterializedEntry};
use serde::Serialize;
use tracing::{debug, trace};

use super::io;
use super::path_locks::PathLocks;
use super::{MaterializeOutcome, MaterializerContext, MaterializerError};
use crate::core::config::DepsPolicy;
use crate::core::fs::timestamp_secs;
use crate::core::store::{ContentStore, StateStore};

/// Writes artifacts from the content store onto disk, tracking what it
/// wrote in the state store so identical rebuilds cost no content I/O.
#[derive(Debug)]
pub struct DeferredMaterializer {
    root: PathBuf,
    cas: ContentStore,
    state: Arc<StateStore>,
    locks: PathLocks,
    deps_policy: DepsPolicy,
    reserved: Vec<ArtifactPath>,
    counters: Counters,
}

#[derive(Debug, Default)]
struct Counters {
    materialized: AtomicU64,
    deps_updated: AtomicU64,
    skipped: AtomicU64,
    invalidated: AtomicU64,
    bytes_written: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MaterializerCounters {
    pub materialized: u64,
    pub deps_updated: u64,
    pub skipped: u64,
    pub invalidated: u64,
    pub bytes_written: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CleanStaleSummary {
    pub scanned: usize,
    pub removed: Vec<ArtifactPath>,
    pub retained: usize,
}

impl DeferredMaterializer {
    pub fn new(ctx: MaterializerContext, state: Arc<StateStore>) -> Self {
        Self {
            root: ctx.root,
            cas: ctx.cas,
            state,
            locks: PathLocks::default(),
            deps_policy: ctx.deps_policy,
            reserved: ctx.reserved,
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    /// Ensures `path` holds `identity`.
    ///
    /// An entry with the same identity is reused without reading content:
    /// only its deps (and access time) are recorded. Anything else at the
    /// path is replaced.
    pub async fn request_materialize(
        &self,
        path: ArtifactPath,
        identity: ArtifactIdentity,
        deps: BTreeSet<ArtifactPath>,
    ) -> Result<MaterializeOutcome, MaterializerError> {
        super::check_reserved(&self.reserved, &path)?;
        let _guard = self.locks.acquire(&path).await;
        let now = timestamp_secs();

        if let Some(existing) = self.state.get(&path) {
            if existing.matches(&identity) {
                if self.present(&path).await {
                    return self.reuse(&path, &existing, deps, now).await;
                }
                debug!(%path, "tracked artifact missing on disk");
            }
        }
        self.materialize_locked(path, identity, deps, now).await
    }

    async fn reuse(
        &self,
        path: &ArtifactPath,
        existing: &MaterializedEntry,
        deps: BTreeSet<ArtifactPath>,
        now: u64,
    ) -> Result<MaterializeOutcome, MaterializerError> {
        let key = path.clone();
        if self.deps_policy == DepsPolicy::Compare && existing.deps == deps {
            trace!(%path, "already materialized, skipping");
            self.record(path, move |state| state.touch(&key, now)).await?;
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(MaterializeOutcome::Skipped);
        }
        trace!(%path, deps = deps.len(), "already materialized, updating deps only");
        self.record(path, move |state| state.update_deps(&key, deps, now))
            .await?;
        self.counters.deps_updated.fetch_add(1, Ordering::Relaxed);
        Ok(MaterializeOutcome::DepsUpdated)
    }

    async fn materialize_locked(
        &self,
        path: ArtifactPath,
        identity: ArtifactIdentity,
        deps: BTreeSet<ArtifactPath>,
        now: u64,
    ) -> Result<MaterializeOutcome, MaterializerError> {
        trace!(
            %path,
            digest = %identity.digest(),
            kind = identity.kind_tag(),
            "materialize artifact"
        );
        self.forget_overlapping(&path).await?;
        // Drop the entry before touching disk so a failed write is never
        // mistaken for a match later.
        let key = path.clone();
        self.record(&path, move |state| state.remove(&key)).await?;

        let cas = self.cas.clone();
        let root = self.root.clone();
        let job_path = path.clone();
        let job_identity = identity.clone();
        let written = tokio::task::spawn_blocking(move || {
            io::write_artifact(&cas, &root, &job_path, &job_identity)
        })
        .await
        .map_err(|err| MaterializerError::join(&path, &err))?
        .map_err(|err| MaterializerError::write(&path, &err))?;

        let entry = MaterializedEntry::new(path.clone(), identity, deps, now);
        self.record(&path, move |state| state.put(entry)).await?;
        self.counters.materialized.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_written
            .fetch_add(written.bytes, Ordering::Relaxed);
        debug!(
            %path,
            files = written.files,
            bytes = written.bytes,
            replaced = written.replaced,
            "wrote artifact"
        );
        Ok(MaterializeOutcome::Materialized)
    }

    /// Records content that already exists on disk (e.g. a source file)
    /// without writing anything.
    pub async fn declare_existing(
        &self,
        path: ArtifactPath,
        identity: ArtifactIdentity,
        deps: BTreeSet<ArtifactPath>,
    ) -> Result<(), MaterializerError> {
        super::check_reserved(&self.reserved, &path)?;
        let _guard = self.locks.acquire(&path).await;
        self.forget_overlapping(&path).await?;
        debug!(%path, digest = %identity.digest(), "declared existing artifact");
        let entry = MaterializedEntry::new(path.clone(), identity, deps, timestamp_secs());
        self.record(&path, move |state| state.put(entry)).await
    }

    /// Forgets `path` and deletes its on-disk content. Returns whether the
    /// path was tracked.
    pub async fn invalidate(&self, path: &ArtifactPath) -> Result<bool, MaterializerError> {
        super::check_reserved(&self.reserved, path)?;
        let _guard = self.locks.acquire(path).await;
        self.invalidate_locked(path).await
    }

    async fn invalidate_locked(&self, path: &ArtifactPath) -> Result<bool, MaterializerError> {
        self.forget_overlapping(path).await?;
        let key = path.clone();
        let tracked = self
            .record(path, move |state| state.remove(&key))
            .await?
            .is_some();
        let root = self.root.clone();
        let job_path = path.clone();
        let removed =
            tokio::task::spawn_blocking(move || io::remove_artifact(&root, &job_path))
                .await
                .map_err(|err| MaterializerError::join(path, &err))?
                .map_err(|err| MaterializerError::write(path, &err))?;
        if tracked || removed {
            self.counters.invalidated.fetch_add(1, Ordering::Relaxed);
        }
        debug!(%path, tracked, removed, "invalidated artifact");
        Ok(tracked)
    }

    #[must_use]
    pub fn has_artifact_at(&self, path: &ArtifactPath) -> bool {
        self.state.contains(path)
    }

    /// Absolute location of a tracked artifact.
    #[must_use]
    pub fn get_materialized_path(&self, path: &ArtifactPath) -> Option<PathBuf> {
        self.state
            .contains(path)
            .then(|| io::absolute(&self.root, path))
    }

    /// Removes entries (and their content) not accessed within `ttl_secs`.
    pub async fn clean_stale(
        &self,
        ttl_secs: u64,
        now: u64,
    ) -> Result<CleanStaleSummary, MaterializerError> {
        let entries = self.state.entries();
        let mut summary = CleanStaleSummary {
            scanned: entries.len(),
            ..CleanStaleSummary::default()
        };
        for entry in entries {
            if !super::is_stale(&entry, ttl_secs, now) {
                summary.retained += 1;
                continue;
            }
            let _guard = self.locks.acquire(&entry.path).await;
            // re-check under the lock; a request may have refreshed it
            match self.state.get(&entry.path) {
                Some(current) if super::is_stale(&current, ttl_secs, now) => {
                    self.invalidate_locked(&entry.path).await?;
                    summary.removed.push(entry.path);
                }
                Some(_) => summary.retained += 1,
                None => {}
            }
        }
        if !summary.removed.is_empty() {
            debug!(removed = summary.removed.len(), ttl_secs, "cleaned stale artifacts");
        }
        Ok(summary)
    }

    #[must_use]
    pub fn counters(&self) -> MaterializerCounters {
        MaterializerCounters {
            materialized: self.counters.materialized.load(Ordering::Relaxed),
            deps_updated: self.counters.deps_updated.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            invalidated: self.counters.invalidated.load(Ordering::Relaxed),
            bytes_written: self.counters.bytes_written.load(Ordering::Relaxed),
        }
    }

    /// Tracked ancestors and descendants no longer describe what is on disk
    /// once `path` changes. The path lock keeps them idle meanwhile.
    async fn forget_overlapping(&self, path: &ArtifactPath) -> Result<(), MaterializerError> {
        let overlapping = self.state.paths_overlapping(path);
        if overlapping.is_empty() {
            return Ok(());
        }
        for other in &overlapping {
            debug!(%path, overlapping = %other, "forgetting overlapping artifact");
        }
        self.record(path, move |state| {
            for other in &overlapping {
                state.remove(other)?;
            }
            Ok(())
        })
        .await
    }

    async fn record<T, F>(&self, path: &ArtifactPath, op: F) -> Result<T, MaterializerError>
    where
        F: FnOnce(&StateStore) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        super::record_state(&self.state, path, op).await
    }

    async fn present(&self, path: &ArtifactPath) -> bool {
        tokio::fs::symlink_metadata(io::absolute(&self.root, path))
            .await
            .is_ok()
    }
}
