/// Errors raised while constructing artifact identities or paths.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("[MZ100] malformed digest '{0}': expected '<sha256 hex>:<size>'")]
    MalformedDigest(String),
    #[error("[MZ100] digest declares size {size} but carries no content hash")]
    SizeWithoutContent { size: u64 },
    #[error("[MZ100] declared size {declared} does not match content length {actual}")]
    SizeMismatch { declared: u64, actual: u64 },
    #[error("[MZ101] invalid directory entry name '{0}'")]
    InvalidEntryName(String),
    #[error("[MZ101] symlink target must not be empty")]
    EmptySymlinkTarget,
    #[error("[MZ101] flattened tree is malformed: {0}")]
    MalformedTree(String),
    #[error("[MZ102] artifact path '{0}' must be relative and normalized")]
    InvalidPath(String),
}
