#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

mod digest;
mod entry;
mod error;
mod identity;
mod path;

pub use digest::Digest;
pub use entry::{EntryStamp, MaterializedEntry};
pub use error::IdentityError;
pub use identity::{ArtifactIdentity, ArtifactKind, FlatKind, FlatNode};
pub use path::ArtifactPath;
