//! Virtualized strategy: artifacts are projected and hydrated on first access.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;
use mz_domain::{ArtifactIdentity, ArtifactPath, MaterializedEntry};
use tracing::{debug, trace};

use super::deferred::{CleanStaleSummary, MaterializerCounters};
use super::io;
use super::path_locks::PathLocks;
use super::{MaterializeOutcome, MaterializerError};
use crate::core::fs::timestamp_secs;
use crate::core::store::{ContentStore, StateStore};

/// Virtual filesystem that presents artifacts without writing them up front.
///
/// Methods may block; the materializer calls them from `spawn_blocking`.
pub trait ProjectionService: Send + Sync + fmt::Debug {
    /// Makes `identity` visible at `path`, replacing any earlier projection.
    fn project(&self, path: &ArtifactPath, identity: &ArtifactIdentity) -> Result<()>;

    fn projection(&self, path: &ArtifactPath) -> Option<ArtifactIdentity>;

    /// Fetches projected content onto local disk and returns its location.
    fn hydrate(&self, path: &ArtifactPath) -> Result<PathBuf>;

    /// Re-registers a projection recorded by an earlier daemon without
    /// touching disk. Content already present counts as hydrated.
    fn restore(&self, path: &ArtifactPath, identity: &ArtifactIdentity);

    fn is_hydrated(&self, path: &ArtifactPath) -> bool;

    /// Drops the projection and any hydrated content.
    fn remove(&self, path: &ArtifactPath) -> Result<bool>;

    fn location(&self, path: &ArtifactPath) -> PathBuf;

    fn projected(&self) -> usize;
}

#[derive(Clone, Debug)]
struct Projection {
    identity: ArtifactIdentity,
    hydrated: bool,
}

/// Projection service backed by the local content store and build root.
#[derive(Debug)]
pub struct LocalProjection {
    root: PathBuf,
    cas: ContentStore,
    projections: RwLock<HashMap<ArtifactPath, Projection>>,
}

impl LocalProjection {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, cas: ContentStore) -> Self {
        Self {
            root: root.into(),
            cas,
            projections: RwLock::default(),
        }
    }
}

impl ProjectionService for LocalProjection {
    fn project(&self, path: &ArtifactPath, identity: &ArtifactIdentity) -> Result<()> {
        // stale bytes must not be visible under the new projection
        io::remove_artifact(&self.root, path)?;
        let mut projections = self
            .projections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        projections.retain(|other, _| !(other.starts_with(path) || path.starts_with(other)));
        projections.insert(
            path.clone(),
            Projection {
                identity: identity.clone(),
                hydrated: false,
            },
        );
        Ok(())
    }

    fn projection(&self, path: &ArtifactPath) -> Option<ArtifactIdentity> {
        self.projections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .map(|projection| projection.identity.clone())
    }

    fn hydrate(&self, path: &ArtifactPath) -> Result<PathBuf> {
        let location = self.location(path);
        let identity = {
            let projections = self.projections.read().unwrap_or_else(PoisonError::into_inner);
            match projections.get(path) {
                Some(projection) if projection.hydrated => return Ok(location),
                Some(projection) => projection.identity.clone(),
                None => anyhow::bail!("{path} is not projected"),
            }
        };
        io::write_artifact(&self.cas, &self.root, path, &identity)?;
        if let Some(projection) = self
            .projections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(path)
        {
            projection.hydrated = true;
        }
        Ok(location)
    }

    fn restore(&self, path: &ArtifactPath, identity: &ArtifactIdentity) {
        let hydrated = self.location(path).symlink_metadata().is_ok();
        self.projections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                path.clone(),
                Projection {
                    identity: identity.clone(),
                    hydrated,
                },
            );
    }

    fn is_hydrated(&self, path: &ArtifactPath) -> bool {
        self.projections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .is_some_and(|projection| projection.hydrated)
    }

    fn remove(&self, path: &ArtifactPath) -> Result<bool> {
        let known = self
            .projections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path)
            .is_some();
        let removed = io::remove_artifact(&self.root, path)?;
        Ok(known || removed)
    }

    fn location(&self, path: &ArtifactPath) -> PathBuf {
        io::absolute(&self.root, path)
    }

    fn projected(&self) -> usize {
        self.projections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Projects artifacts through a [`ProjectionService`].
///
/// Projections are recorded in the state store like deferred writes, so a
/// restarted daemon with the same configuration picks them up again.
#[derive(Debug)]
pub struct VirtualizedMaterializer {
    root: PathBuf,
    service: Arc<dyn ProjectionService>,
    state: Arc<StateStore>,
    locks: PathLocks,
    reserved: Vec<ArtifactPath>,
    projected: AtomicU64,
    skipped: AtomicU64,
    invalidated: AtomicU64,
}

impl VirtualizedMaterializer {
    pub fn new(
        root: impl Into<PathBuf>,
        service: Arc<dyn ProjectionService>,
        state: Arc<StateStore>,
        reserved: Vec<ArtifactPath>,
    ) -> Self {
        Self {
            root: root.into(),
            service,
            state,
            locks: PathLocks::default(),
            reserved,
            projected: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            invalidated: AtomicU64::new(0),
        }
    }

    /// Hands every recorded projection back to the service. Returns how
    /// many were restored.
    pub fn restore_projections(&self) -> usize {
        let entries = self.state.entries();
        for entry in &entries {
            self.service.restore(&entry.path, &entry.identity);
        }
        if !entries.is_empty() {
            debug!(restored = entries.len(), "restored recorded projections");
        }
        entries.len()
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Projects `identity` at `path`; resolves without writing content.
    pub async fn request_materialize(
        &self,
        path: ArtifactPath,
        identity: ArtifactIdentity,
        deps: BTreeSet<ArtifactPath>,
    ) -> Result<MaterializeOutcome, MaterializerError> {
        super::check_reserved(&self.reserved, &path)?;
        let _guard = self.locks.acquire(&path).await;
        let now = timestamp_secs();
        if self.service.projection(&path).as_ref() == Some(&identity) {
            trace!(%path, "already projected, skipping");
            let key = path.clone();
            super::record_state(&self.state, &path, move |state| {
                if state.contains(&key) {
                    state.update_deps(&key, deps, now).map(|_| ())
                } else {
                    state.put(MaterializedEntry::new(key, identity, deps, now))
                }
            })
            .await?;
            self.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(MaterializeOutcome::Skipped);
        }
        trace!(%path, digest = %identity.digest(), "project artifact");
        let key = path.clone();
        super::record_state(&self.state, &path, move |state| {
            for other in state.paths_overlapping(&key) {
                state.remove(&other)?;
            }
            state.remove(&key).map(|_| ())
        })
        .await?;

        let service = Arc::clone(&self.service);
        let job_path = path.clone();
        let job_identity = identity.clone();
        tokio::task::spawn_blocking(move || service.project(&job_path, &job_identity))
            .await
            .map_err(|err| MaterializerError::join(&path, &err))?
            .map_err(|err| MaterializerError::write(&path, &err))?;

        let entry = MaterializedEntry::new(path.clone(), identity, deps, now);
        super::record_state(&self.state, &path, move |state| state.put(entry)).await?;
        self.projected.fetch_add(1, Ordering::Relaxed);
        Ok(MaterializeOutcome::Materialized)
    }

    /// Hydrates `path` (once) and returns its on-disk location.
    pub async fn ensure_local(&self, path: &ArtifactPath) -> Result<PathBuf, MaterializerError> {
        let _guard = self.locks.acquire(path).await;
        if self.service.projection(path).is_none() {
            return Err(MaterializerError::NotMaterialized { path: path.clone() });
        }
        if self.service.is_hydrated(path) {
            return Ok(self.service.location(path));
        }
        trace!(%path, "hydrating projected artifact");
        let service = Arc::clone(&self.service);
        let job_path = path.clone();
        tokio::task::spawn_blocking(move || service.hydrate(&job_path))
            .await
            .map_err(|err| MaterializerError::join(path, &err))?
            .map_err(|err| MaterializerError::write(path, &err))
    }

    /// Reads a projected file, hydrating it first if needed.
    pub async fn read(&self, path: &ArtifactPath) -> Result<Vec<u8>, MaterializerError> {
        let location = self.ensure_local(path).await?;
        tokio::fs::read(&location)
            .await
            .map_err(|err| MaterializerError::MaterializeIo {
                path: path.clone(),
                reason: format!("failed to read {}: {err}", location.display()),
            })
    }

    pub async fn invalidate(&self, path: &ArtifactPath) -> Result<bool, MaterializerError> {
        super::check_reserved(&self.reserved, path)?;
        let _guard = self.locks.acquire(path).await;
        self.invalidate_locked(path).await
    }

    async fn invalidate_locked(&self, path: &ArtifactPath) -> Result<bool, MaterializerError> {
        let key = path.clone();
        super::record_state(&self.state, path, move |state| state.remove(&key).map(|_| ()))
            .await?;
        let service = Arc::clone(&self.service);
        let job_path = path.clone();
        let removed = tokio::task::spawn_blocking(move || service.remove(&job_path))
            .await
            .map_err(|err| MaterializerError::join(path, &err))?
            .map_err(|err| MaterializerError::write(path, &err))?;
        if removed {
            self.invalidated.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    /// Drops projections not requested within `ttl_secs`.
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
            match self.state.get(&entry.path) {
                Some(current) if super::is_stale(&current, ttl_secs, now) => {
                    self.invalidate_locked(&entry.path).await?;
                    summary.removed.push(entry.path);
                }
                Some(_) => summary.retained += 1,
                None => {}
            }
        }
        Ok(summary)
    }

    #[must_use]
    pub fn has_artifact_at(&self, path: &ArtifactPath) -> bool {
        self.service.projection(path).is_some()
    }

    #[must_use]
    pub fn get_materialized_path(&self, path: &ArtifactPath) -> Option<PathBuf> {
        self.has_artifact_at(path)
            .then(|| self.service.location(path))
    }

    #[must_use]
    pub fn projected(&self) -> usize {
        self.service.projected()
    }

    #[must_use]
    pub fn counters(&self) -> MaterializerCounters {
        MaterializerCounters {
            materialized: self.projected.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            invalidated: self.invalidated.load(Ordering::Relaxed),
            ..MaterializerCounters::default()
        }
    }
}
