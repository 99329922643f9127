//! Connection + transaction helpers.

use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, TransactionBehavior};

use super::super::StateMeta;
use super::StateDb;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

impl StateDb {
    pub(in crate::core::store::state) fn open(path: &Path, meta: StateMeta) -> Result<Self> {
        let conn = connect(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            conn,
            meta,
        })
    }

    pub(super) fn with_immediate_tx<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start materializer state transaction")?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Removes the database (and its WAL companions) and starts over with
    /// an empty schema and fresh meta.
    pub(in crate::core::store::state) fn recreate(&mut self) -> Result<()> {
        let placeholder =
            Connection::open_in_memory().context("failed to open placeholder connection")?;
        let old = std::mem::replace(&mut self.conn, placeholder);
        if let Err((_, err)) = old.close() {
            tracing::debug!(error = %err, "closing stale materializer state failed");
        }
        for path in sidecar_paths(&self.path) {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to remove {}", path.display()))
                }
            }
        }
        self.conn = connect(&self.path)?;
        configure(&self.conn)?;
        self.init_schema()?;
        self.write_meta()?;
        Ok(())
    }
}

pub(super) fn connect(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open materializer state at {}", path.display()))?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .context("failed to set busy timeout for materializer state")?;
    Ok(conn)
}

pub(super) fn configure(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL for materializer state")?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign keys for materializer state")?;
    Ok(())
}

fn sidecar_paths(path: &Path) -> [PathBuf; 3] {
    let with_suffix = |suffix: &str| {
        let mut raw: OsString = path.as_os_str().to_owned();
        raw.push(suffix);
        PathBuf::from(raw)
    };
    [path.to_path_buf(), with_suffix("-wal"), with_suffix("-shm")]
}
