use mz_domain::IdentityError;

use crate::core::lifecycle::StartupError;
use crate::core::materializer::MaterializerError;
use crate::core::store::{CasError, StoreError};

pub mod identity {
    pub const MALFORMED_DIGEST: &str = "MZ100";
    pub const INVALID_ENTRY: &str = "MZ101";
    pub const INVALID_PATH: &str = "MZ102";
}

pub mod cas {
    pub const MISSING_OR_CORRUPT: &str = "MZ800";
    pub const STORE_WRITE_FAILURE: &str = "MZ801";
}

pub mod state {
    pub const WRITE_FAILURE: &str = "MZ810";
    pub const CORRUPT: &str = "MZ811";
    pub const FORMAT_INCOMPATIBLE: &str = "MZ812";
}

pub mod materialize {
    pub const IO_FAILURE: &str = "MZ820";
    pub const STATE_FAILURE: &str = "MZ821";
    pub const MISSING_CONTENT: &str = "MZ822";
    pub const RESERVED_PATH: &str = "MZ823";
    pub const NOT_MATERIALIZED: &str = "MZ824";
}

pub mod startup {
    pub const LAYOUT: &str = "MZ900";
    pub const DAEMON_LOCKED: &str = "MZ901";
    pub const UNSUPPORTED_STRATEGY: &str = "MZ902";
    pub const STATE_UNAVAILABLE: &str = "MZ903";
    pub const CONFIG: &str = "MZ904";
}

/// Code of the first typed error in `err`'s cause chain.
#[must_use]
pub fn code_of(err: &anyhow::Error) -> Option<&'static str> {
    err.chain().find_map(|cause| {
        if let Some(err) = cause.downcast_ref::<StartupError>() {
            return Some(err.code());
        }
        if let Some(err) = cause.downcast_ref::<MaterializerError>() {
            return Some(err.code());
        }
        if let Some(err) = cause.downcast_ref::<StoreError>() {
            return Some(err.code());
        }
        if let Some(err) = cause.downcast_ref::<CasError>() {
            return Some(err.code());
        }
        cause.downcast_ref::<IdentityError>().map(identity_code)
    })
}

fn identity_code(err: &IdentityError) -> &'static str {
    match err {
        IdentityError::MalformedDigest(_)
        | IdentityError::SizeWithoutContent { .. }
        | IdentityError::SizeMismatch { .. } => identity::MALFORMED_DIGEST,
        IdentityError::InvalidEntryName(_)
        | IdentityError::EmptySymlinkTarget
        | IdentityError::MalformedTree(_) => identity::INVALID_ENTRY,
        IdentityError::InvalidPath(_) => identity::INVALID_PATH,
    }
}
