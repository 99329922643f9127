//! Daemon lifetime: startup reconciliation, request entry points and
//! shutdown.
//!
//! [`MaterializerService::on_startup`] is the only way to obtain a
//! materializer. It takes the build root's daemon lock, reconciles the cache
//! layout with the configuration, then opens (or resets) the state store
//! before the first request is served. Nothing here rescans the output tree;
//! on-disk drift is detected lazily when a path is requested again.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use mz_domain::{ArtifactIdentity, ArtifactPath};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::config::{DepsPolicy, MaterializationMethod, MaterializerConfig};
use crate::core::fs::{format_timestamp, remove_path, timestamp_secs};
use crate::core::materializer::{
    CleanStaleSummary, DeferredMaterializer, LocalProjection, MaterializeOutcome, Materializer,
    MaterializerContext, MaterializerCounters, MaterializerError, VirtualizedMaterializer,
};
use crate::core::store::state::SCHEMA_VERSION;
use crate::core::store::{CommandHashStore, ContentStore, StateMeta, StateStore};
use crate::core::tooling::diagnostics;

mod daemon_lock;
mod layout;

#[cfg(test)]
mod tests;

pub use daemon_lock::DaemonLock;
pub use layout::CacheDirectoryLayout;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("[MZ900] cache layout error at {path}: {reason}", path = .path.display())]
    Layout { path: PathBuf, reason: String },
    #[error("[MZ901] another materializer daemon owns {path}", path = .path.display())]
    DaemonLocked { path: PathBuf },
    #[error("[MZ902] materializations = {0} is not supported on this platform")]
    UnsupportedStrategy(String),
    #[error("[MZ903] materializer state is unavailable: {0}")]
    StateUnavailable(String),
    #[error("[MZ904] invalid materializer configuration: {0}")]
    Config(String),
}

impl StartupError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Layout { .. } => diagnostics::startup::LAYOUT,
            Self::DaemonLocked { .. } => diagnostics::startup::DAEMON_LOCKED,
            Self::UnsupportedStrategy(_) => diagnostics::startup::UNSUPPORTED_STRATEGY,
            Self::StateUnavailable(_) => diagnostics::startup::STATE_UNAVAILABLE,
            Self::Config(_) => diagnostics::startup::CONFIG,
        }
    }

    fn layout(path: &Path, err: &anyhow::Error) -> Self {
        Self::Layout {
            path: path.to_path_buf(),
            reason: format!("{err:#}"),
        }
    }
}

/// How the state store was brought up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StateDisposition {
    InMemory,
    Created,
    Reused { loaded: usize, skipped: usize },
    Reset { reason: String },
}

/// One unit of work for [`MaterializerService::request_materialize`].
#[derive(Clone, Debug)]
pub struct MaterializeRequest {
    pub path: ArtifactPath,
    pub identity: ArtifactIdentity,
    pub deps: BTreeSet<ArtifactPath>,
    /// Producing command line, recorded when command hashing is enabled.
    pub command: Option<Vec<String>>,
}

impl MaterializeRequest {
    #[must_use]
    pub fn new(path: ArtifactPath, identity: ArtifactIdentity) -> Self {
        Self {
            path,
            identity,
            deps: BTreeSet::new(),
            command: None,
        }
    }

    #[must_use]
    pub fn with_deps(mut self, deps: impl IntoIterator<Item = ArtifactPath>) -> Self {
        self.deps = deps.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_command(mut self, argv: Vec<String>) -> Self {
        self.command = Some(argv);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigChange {
    Unchanged,
    /// Keys whose new values only apply to the next daemon.
    RestartRequired(Vec<&'static str>),
}

#[derive(Clone, Debug, Serialize)]
pub struct ServiceStatus {
    pub build_root: PathBuf,
    pub started_at: String,
    pub materializations: MaterializationMethod,
    pub durable: bool,
    pub state_version: u32,
    pub schema_version: u32,
    pub hash_all_commands: bool,
    pub deps_policy: DepsPolicy,
    pub state: StateDisposition,
    pub entries: usize,
    pub pending_access_times: usize,
    pub counters: MaterializerCounters,
    pub cache_dirs: Vec<String>,
    pub cache_bytes: u64,
}

#[derive(Debug)]
pub struct MaterializerService {
    config: MaterializerConfig,
    layout: CacheDirectoryLayout,
    cas: ContentStore,
    state: Arc<StateStore>,
    command_hashes: Option<CommandHashStore>,
    materializer: Materializer,
    disposition: StateDisposition,
    started_at: u64,
    lock: DaemonLock,
}

impl MaterializerService {
    /// Loads configuration for `build_root` and starts from it.
    pub fn start(build_root: &Path) -> Result<Self, StartupError> {
        let config = MaterializerConfig::load(build_root)
            .map_err(|err| StartupError::Config(format!("{err:#}")))?;
        Self::on_startup(config)
    }

    /// Brings the materializer up for `config.build_root`.
    pub fn on_startup(config: MaterializerConfig) -> Result<Self, StartupError> {
        let layout = CacheDirectoryLayout::new(&config.build_root);
        let lock = DaemonLock::acquire(&layout.daemon_lock_path())?;

        if !config.materializations.is_supported() {
            return Err(StartupError::UnsupportedStrategy(
                config.materializations.to_string(),
            ));
        }

        layout
            .reconcile(config.sqlite_materializer_state, config.hash_all_commands)
            .map_err(|err| StartupError::layout(&layout.cache_root(), &err))?;
        let cas_root = layout.cas_root();
        let cas = ContentStore::open(&cas_root)
            .map_err(|err| StartupError::layout(&cas_root, &err))?;

        let (state, disposition) = open_state(&layout, &config)?;
        let state = Arc::new(state);

        let command_hashes = if config.hash_all_commands {
            let dir = layout.command_hashes_dir();
            Some(CommandHashStore::open(&dir).map_err(|err| StartupError::layout(&dir, &err))?)
        } else {
            None
        };

        let ctx = MaterializerContext {
            root: config.build_root.clone(),
            cas: cas.clone(),
            deps_policy: config.deps_policy,
            reserved: layout.reserved_paths(),
        };
        let materializer = match config.materializations {
            MaterializationMethod::Deferred => {
                Materializer::Deferred(DeferredMaterializer::new(ctx, Arc::clone(&state)))
            }
            MaterializationMethod::Eden => {
                let service = Arc::new(LocalProjection::new(&ctx.root, ctx.cas.clone()));
                let virtualized = VirtualizedMaterializer::new(
                    ctx.root,
                    service,
                    Arc::clone(&state),
                    ctx.reserved,
                );
                virtualized.restore_projections();
                Materializer::Virtualized(virtualized)
            }
        };

        info!(
            root = %config.build_root.display(),
            materializations = %config.materializations,
            durable = state.is_durable(),
            entries = state.len(),
            "materializer started"
        );
        Ok(Self {
            config,
            layout,
            cas,
            state,
            command_hashes,
            materializer,
            disposition,
            started_at: timestamp_secs(),
            lock,
        })
    }

    /// Flushes buffered access times and releases the daemon lock.
    pub fn on_shutdown(self) -> Result<()> {
        let flushed = self.state.flush()?;
        debug!(
            flushed,
            lock = %self.lock.path().display(),
            "materializer shut down"
        );
        Ok(())
    }

    pub async fn request_materialize(
        &self,
        request: MaterializeRequest,
    ) -> Result<MaterializeOutcome, MaterializerError> {
        let MaterializeRequest {
            path,
            identity,
            deps,
            command,
        } = request;
        let outcome = self
            .materializer
            .request_materialize(path.clone(), identity, deps)
            .await?;
        if let (Some(store), Some(argv)) = (&self.command_hashes, command) {
            let store = store.clone();
            let key = path.clone();
            let hash = tokio::task::spawn_blocking(move || {
                store.record(&key, &argv, timestamp_secs())
            })
            .await
            .map_err(|err| MaterializerError::join(&path, &err))?
            .map_err(|err| MaterializerError::state(&path, &err))?;
            debug!(%path, %hash, "recorded command hash");
        }
        Ok(outcome)
    }

    pub async fn declare_existing(
        &self,
        path: ArtifactPath,
        identity: ArtifactIdentity,
        deps: BTreeSet<ArtifactPath>,
    ) -> Result<(), MaterializerError> {
        self.materializer.declare_existing(path, identity, deps).await
    }

    pub async fn invalidate(&self, path: &ArtifactPath) -> Result<bool, MaterializerError> {
        self.materializer.invalidate(path).await
    }

    pub async fn ensure_local(&self, path: &ArtifactPath) -> Result<PathBuf, MaterializerError> {
        self.materializer.ensure_local(path).await
    }

    #[must_use]
    pub fn has_artifact_at(&self, path: &ArtifactPath) -> bool {
        self.materializer.has_artifact_at(path)
    }

    #[must_use]
    pub fn get_materialized_path(&self, path: &ArtifactPath) -> Option<PathBuf> {
        self.materializer.get_materialized_path(path)
    }

    /// Sweeps idle artifacts; `None` uses the configured TTL.
    pub async fn clean_stale(
        &self,
        ttl_secs: Option<u64>,
    ) -> Result<CleanStaleSummary, MaterializerError> {
        let ttl = ttl_secs.unwrap_or(self.config.clean_stale_ttl_secs);
        self.materializer.clean_stale(ttl, timestamp_secs()).await
    }

    /// Compares `next` against the running configuration. The running
    /// daemon keeps its settings either way.
    #[must_use]
    pub fn reconfigure(&self, next: &MaterializerConfig) -> ConfigChange {
        let current = &self.config;
        let mut changed = Vec::new();
        if current.materializations != next.materializations {
            changed.push("materializations");
        }
        if current.sqlite_materializer_state != next.sqlite_materializer_state {
            changed.push("sqlite_materializer_state");
        }
        if current.sqlite_materializer_state_version != next.sqlite_materializer_state_version {
            changed.push("sqlite_materializer_state_version");
        }
        if current.hash_all_commands != next.hash_all_commands {
            changed.push("hash_all_commands");
        }
        if current.deps_policy != next.deps_policy {
            changed.push("deps_policy");
        }
        if current.access_time_flush_threshold != next.access_time_flush_threshold {
            changed.push("access_time_flush_threshold");
        }
        if changed.is_empty() {
            return ConfigChange::Unchanged;
        }
        warn!(keys = ?changed, "materializer configuration changed; restart the daemon to apply");
        ConfigChange::RestartRequired(changed)
    }

    pub fn status(&self) -> Result<ServiceStatus> {
        Ok(ServiceStatus {
            build_root: self.config.build_root.clone(),
            started_at: format_timestamp(self.started_at),
            materializations: self.materializer.method(),
            durable: self.state.is_durable(),
            state_version: self.config.sqlite_materializer_state_version,
            schema_version: SCHEMA_VERSION,
            hash_all_commands: self.command_hashes.is_some(),
            deps_policy: self.config.deps_policy,
            state: self.disposition.clone(),
            entries: self.state.len(),
            pending_access_times: self.state.pending_access_count(),
            counters: self.materializer.counters(),
            cache_dirs: self.layout.cache_listing()?,
            cache_bytes: self.layout.cache_bytes(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &MaterializerConfig {
        &self.config
    }

    #[must_use]
    pub fn layout(&self) -> &CacheDirectoryLayout {
        &self.layout
    }

    #[must_use]
    pub fn content_store(&self) -> &ContentStore {
        &self.cas
    }

    #[must_use]
    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    #[must_use]
    pub fn command_hashes(&self) -> Option<&CommandHashStore> {
        self.command_hashes.as_ref()
    }

    #[must_use]
    pub fn materializer(&self) -> &Materializer {
        &self.materializer
    }

    #[must_use]
    pub fn disposition(&self) -> &StateDisposition {
        &self.disposition
    }
}

fn open_state(
    layout: &CacheDirectoryLayout,
    config: &MaterializerConfig,
) -> Result<(StateStore, StateDisposition), StartupError> {
    let threshold = config.access_time_flush_threshold;
    if !config.sqlite_materializer_state {
        return Ok((StateStore::in_memory(threshold), StateDisposition::InMemory));
    }

    let db = layout.state_db();
    let meta = StateMeta {
        state_version: config.sqlite_materializer_state_version,
        materializations: config.materializations,
    };
    let existed = db.exists();
    let unavailable = |err: &anyhow::Error| StartupError::StateUnavailable(format!("{err:#}"));
    let store = match StateStore::open_durable(&db, meta, threshold) {
        Ok(store) => store,
        Err(err) => {
            warn!(db = %db.display(), error = %format!("{err:#}"), "failed to open materializer state; recreating");
            remove_path(&db).map_err(|err| StartupError::layout(&db, &err))?;
            StateStore::open_durable(&db, meta, threshold).map_err(|err| unavailable(&err))?
        }
    };

    if !existed {
        store.reset().map_err(|err| unavailable(&err))?;
        debug!(db = %db.display(), "created materializer state");
        return Ok((store, StateDisposition::Created));
    }

    match store.validate().and_then(|()| store.load()) {
        Ok(summary) => {
            debug!(
                db = %db.display(),
                loaded = summary.loaded,
                skipped = summary.skipped,
                "reusing materializer state"
            );
            Ok((
                store,
                StateDisposition::Reused {
                    loaded: summary.loaded,
                    skipped: summary.skipped,
                },
            ))
        }
        Err(err) => {
            let reason = format!("{err:#}");
            warn!(db = %db.display(), %reason, "materializer state is stale or unreadable; resetting");
            store.reset().map_err(|err| unavailable(&err))?;
            Ok((store, StateDisposition::Reset { reason }))
        }
    }
}
