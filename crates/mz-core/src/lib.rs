#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

mod core;

pub use crate::core::config::{DepsPolicy, MaterializationMethod, MaterializerConfig, CONFIG_FILENAME};
pub use crate::core::lifecycle::{
    CacheDirectoryLayout, ConfigChange, DaemonLock, MaterializeRequest, MaterializerService,
    ServiceStatus, StartupError, StateDisposition,
};
pub use crate::core::materializer::{
    CleanStaleSummary, DeferredMaterializer, LocalProjection, MaterializeOutcome, Materializer,
    MaterializerContext, MaterializerCounters, MaterializerError, ProjectionService,
    VirtualizedMaterializer,
};
pub use crate::core::store::{
    CasError, CommandHashStore, CommandRecord, ContentStore, LoadSummary, StateMeta, StateStore,
    StoreError,
};
pub use crate::core::tooling::diagnostics;

pub use mz_domain::{ArtifactIdentity, ArtifactKind, ArtifactPath, Digest, IdentityError};
