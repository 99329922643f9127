pub mod cas;
pub mod command_hashes;
pub mod state;

pub use cas::{CasError, ContentStore};
pub use command_hashes::{CommandHashStore, CommandRecord};
pub use state::{LoadSummary, StateMeta, StateStore, StoreError};
