//! Realizes artifacts on the local filesystem.
//!
//! The active strategy is chosen once at startup: [`DeferredMaterializer`]
//! writes content eagerly and remembers what it wrote, while
//! [`VirtualizedMaterializer`] projects identities and hydrates lazily.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mz_domain::{ArtifactIdentity, ArtifactPath, MaterializedEntry};
use serde::Serialize;

use crate::core::config::{DepsPolicy, MaterializationMethod};
use crate::core::store::{ContentStore, StateStore};

mod deferred;
mod error;
mod io;
mod path_locks;
mod virtualized;

#[cfg(test)]
mod tests;

pub use deferred::{CleanStaleSummary, DeferredMaterializer, MaterializerCounters};
pub use error::MaterializerError;
pub use virtualized::{LocalProjection, ProjectionService, VirtualizedMaterializer};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MaterializeOutcome {
    /// Identity and deps matched; nothing changed.
    Skipped,
    /// Identity matched; only the recorded deps were rewritten.
    DepsUpdated,
    /// Content was written (or projected).
    Materialized,
}

impl MaterializeOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::DepsUpdated => "deps-updated",
            Self::Materialized => "materialized",
        }
    }
}

/// Everything a materializer needs besides its state.
#[derive(Clone, Debug)]
pub struct MaterializerContext {
    pub root: PathBuf,
    pub cas: ContentStore,
    pub deps_policy: DepsPolicy,
    /// Paths the materializer must never write into.
    pub reserved: Vec<ArtifactPath>,
}

fn check_reserved(reserved: &[ArtifactPath], path: &ArtifactPath) -> Result<(), MaterializerError> {
    let clashes = reserved
        .iter()
        .any(|owned| path.starts_with(owned) || owned.starts_with(path));
    if clashes {
        return Err(MaterializerError::ReservedPath { path: path.clone() });
    }
    Ok(())
}

/// Applies a state mutation. Durable stores commit to SQLite, so there the
/// mutation runs on the blocking pool.
async fn record_state<T, F>(
    state: &Arc<StateStore>,
    path: &ArtifactPath,
    op: F,
) -> Result<T, MaterializerError>
where
    F: FnOnce(&StateStore) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    if !state.is_durable() {
        return op(state.as_ref()).map_err(|err| MaterializerError::state(path, &err));
    }
    let state = Arc::clone(state);
    tokio::task::spawn_blocking(move || op(state.as_ref()))
        .await
        .map_err(|err| MaterializerError::join(path, &err))?
        .map_err(|err| MaterializerError::state(path, &err))
}

fn is_stale(entry: &MaterializedEntry, ttl_secs: u64, now: u64) -> bool {
    now.saturating_sub(entry.stamp.last_accessed) > ttl_secs
}

#[derive(Debug)]
pub enum Materializer {
    Deferred(DeferredMaterializer),
    Virtualized(VirtualizedMaterializer),
}

impl Materializer {
    #[must_use]
    pub fn method(&self) -> MaterializationMethod {
        match self {
            Self::Deferred(_) => MaterializationMethod::Deferred,
            Self::Virtualized(_) => MaterializationMethod::Eden,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        match self {
            Self::Deferred(inner) => inner.root(),
            Self::Virtualized(inner) => inner.root(),
        }
    }

    pub async fn request_materialize(
        &self,
        path: ArtifactPath,
        identity: ArtifactIdentity,
        deps: BTreeSet<ArtifactPath>,
    ) -> Result<MaterializeOutcome, MaterializerError> {
        match self {
            Self::Deferred(inner) => inner.request_materialize(path, identity, deps).await,
            Self::Virtualized(inner) => inner.request_materialize(path, identity, deps).await,
        }
    }

    /// Records content already on disk. A virtualized root projects it.
    pub async fn declare_existing(
        &self,
        path: ArtifactPath,
        identity: ArtifactIdentity,
        deps: BTreeSet<ArtifactPath>,
    ) -> Result<(), MaterializerError> {
        match self {
            Self::Deferred(inner) => inner.declare_existing(path, identity, deps).await,
            Self::Virtualized(inner) => inner
                .request_materialize(path, identity, deps)
                .await
                .map(|_| ()),
        }
    }

    pub async fn invalidate(&self, path: &ArtifactPath) -> Result<bool, MaterializerError> {
        match self {
            Self::Deferred(inner) => inner.invalidate(path).await,
            Self::Virtualized(inner) => inner.invalidate(path).await,
        }
    }

    /// Local path holding the artifact's bytes; virtualized artifacts are
    /// hydrated first.
    pub async fn ensure_local(&self, path: &ArtifactPath) -> Result<PathBuf, MaterializerError> {
        match self {
            Self::Deferred(inner) => inner
                .get_materialized_path(path)
                .ok_or_else(|| MaterializerError::NotMaterialized { path: path.clone() }),
            Self::Virtualized(inner) => inner.ensure_local(path).await,
        }
    }

    #[must_use]
    pub fn has_artifact_at(&self, path: &ArtifactPath) -> bool {
        match self {
            Self::Deferred(inner) => inner.has_artifact_at(path),
            Self::Virtualized(inner) => inner.has_artifact_at(path),
        }
    }

    #[must_use]
    pub fn get_materialized_path(&self, path: &ArtifactPath) -> Option<PathBuf> {
        match self {
            Self::Deferred(inner) => inner.get_materialized_path(path),
            Self::Virtualized(inner) => inner.get_materialized_path(path),
        }
    }

    /// Sweeps artifacts idle for longer than `ttl_secs`.
    pub async fn clean_stale(
        &self,
        ttl_secs: u64,
        now: u64,
    ) -> Result<CleanStaleSummary, MaterializerError> {
        match self {
            Self::Deferred(inner) => inner.clean_stale(ttl_secs, now).await,
            Self::Virtualized(inner) => inner.clean_stale(ttl_secs, now).await,
        }
    }

    #[must_use]
    pub fn counters(&self) -> MaterializerCounters {
        match self {
            Self::Deferred(inner) => inner.counters(),
            Self::Virtualized(inner) => inner.counters(),
        }
    }
}
