//! SQLite backing for the state store.
//!
//! Split by responsibility (connection/schema/meta/health/entries). One
//! connection is opened at startup and kept for the daemon lifetime.

use std::path::{Path, PathBuf};

use rusqlite::Connection;

use super::StateMeta;

mod connection;
mod entries;
mod health;
mod meta;
mod schema;

pub(super) struct StateDb {
    path: PathBuf,
    conn: Connection,
    meta: StateMeta,
}

impl StateDb {
    pub(super) fn path(&self) -> &Path {
        &self.path
    }
}
