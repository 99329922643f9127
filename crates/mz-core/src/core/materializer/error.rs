use mz_domain::ArtifactPath;
use thiserror::Error;

use crate::core::tooling::diagnostics;

/// Failure of a single materialization request. Only requests that depend
/// on the failed path observe it.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MaterializerError {
    #[error("[MZ820] failed to materialize {path}: {reason}")]
    MaterializeIo { path: ArtifactPath, reason: String },
    #[error("[MZ821] failed to record materializer state for {path}: {reason}")]
    StateIo { path: ArtifactPath, reason: String },
    #[error("[MZ822] content {digest} for {path} is not available in the content store")]
    MissingContent { path: ArtifactPath, digest: String },
    #[error("[MZ823] {path} is inside a directory owned by the materializer")]
    ReservedPath { path: ArtifactPath },
    #[error("[MZ824] nothing is materialized or projected at {path}")]
    NotMaterialized { path: ArtifactPath },
}

impl MaterializerError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MaterializeIo { .. } => diagnostics::materialize::IO_FAILURE,
            Self::StateIo { .. } => diagnostics::materialize::STATE_FAILURE,
            Self::MissingContent { .. } => diagnostics::materialize::MISSING_CONTENT,
            Self::ReservedPath { .. } => diagnostics::materialize::RESERVED_PATH,
            Self::NotMaterialized { .. } => diagnostics::materialize::NOT_MATERIALIZED,
        }
    }

    #[must_use]
    pub fn path(&self) -> &ArtifactPath {
        match self {
            Self::MaterializeIo { path, .. }
            | Self::StateIo { path, .. }
            | Self::MissingContent { path, .. }
            | Self::ReservedPath { path }
            | Self::NotMaterialized { path } => path,
        }
    }

    pub(crate) fn state(path: &ArtifactPath, err: &anyhow::Error) -> Self {
        Self::StateIo {
            path: path.clone(),
            reason: format!("{err:#}"),
        }
    }

    /// Classifies a write failure, surfacing missing or corrupt content.
    pub(crate) fn write(path: &ArtifactPath, err: &anyhow::Error) -> Self {
        use crate::core::store::CasError;
        match err.downcast_ref::<CasError>() {
            Some(CasError::MissingObject { digest } | CasError::DigestMismatch { digest, .. }) => {
                Self::MissingContent {
                    path: path.clone(),
                    digest: digest.clone(),
                }
            }
            _ => Self::MaterializeIo {
                path: path.clone(),
                reason: format!("{err:#}"),
            },
        }
    }

    pub(crate) fn join(path: &ArtifactPath, err: &tokio::task::JoinError) -> Self {
        Self::MaterializeIo {
            path: path.clone(),
            reason: format!("materialization task failed: {err}"),
        }
    }
}
