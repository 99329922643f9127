//! Row encoding for `materializer_state`.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Context, Result};
use mz_domain::{ArtifactIdentity, ArtifactPath, EntryStamp, FlatNode, MaterializedEntry};
use rusqlite::params;
use tracing::warn;

use super::StateDb;

pub(in crate::core::store::state) struct LoadedRows {
    pub(in crate::core::store::state) entries: Vec<MaterializedEntry>,
    pub(in crate::core::store::state) rejected: Vec<String>,
}

/// Columns as read back; anything but the key may be unreadable.
struct RawRow {
    path: String,
    artifact_type: rusqlite::Result<String>,
    entry_hash: rusqlite::Result<String>,
    entry_size: rusqlite::Result<i64>,
    identity: rusqlite::Result<String>,
    deps: rusqlite::Result<String>,
    materialized_at: rusqlite::Result<i64>,
    last_access_time: rusqlite::Result<i64>,
}

impl RawRow {
    fn decode(self) -> Result<MaterializedEntry> {
        let path = ArtifactPath::new(&self.path)?;
        let nodes: Vec<FlatNode> =
            serde_json::from_str(&self.identity?).context("identity column")?;
        let identity = ArtifactIdentity::from_flat(nodes)?;
        let artifact_type = self.artifact_type?;
        if artifact_type != identity.kind_tag() {
            return Err(anyhow!(
                "artifact_type '{artifact_type}' disagrees with identity kind '{}'",
                identity.kind_tag()
            ));
        }
        let entry_hash = self.entry_hash?;
        let entry_size = u64::try_from(self.entry_size?)?;
        if entry_hash != identity.digest().hash_hex() || entry_size != identity.digest().size() {
            return Err(anyhow!(
                "entry digest {entry_hash}:{entry_size} disagrees with identity {}",
                identity.digest()
            ));
        }
        let deps: BTreeSet<ArtifactPath> =
            serde_json::from_str(&self.deps?).context("deps column")?;
        Ok(MaterializedEntry {
            path,
            identity,
            deps,
            stamp: EntryStamp {
                materialized_at: u64::try_from(self.materialized_at?)?,
                last_accessed: u64::try_from(self.last_access_time?)?,
            },
        })
    }
}

impl StateDb {
    pub(in crate::core::store::state) fn load_entries(&self) -> Result<LoadedRows> {
        let mut stmt = self.conn.prepare(
            "SELECT path, artifact_type, entry_hash, entry_size, identity, deps, \
             materialized_at, last_access_time FROM materializer_state",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RawRow {
                path: row.get(0)?,
                artifact_type: row.get(1),
                entry_hash: row.get(2),
                entry_size: row.get(3),
                identity: row.get(4),
                deps: row.get(5),
                materialized_at: row.get(6),
                last_access_time: row.get(7),
            })
        })?;
        let mut loaded = LoadedRows {
            entries: Vec::new(),
            rejected: Vec::new(),
        };
        for row in rows {
            let row = row?;
            let key = row.path.clone();
            match row.decode() {
                Ok(entry) => loaded.entries.push(entry),
                Err(err) => {
                    warn!(path = %key, error = %err, "discarding unreadable materializer state row");
                    loaded.rejected.push(key);
                }
            }
        }
        Ok(loaded)
    }

    pub(in crate::core::store::state) fn upsert(&mut self, entry: &MaterializedEntry) -> Result<()> {
        let identity = serde_json::to_string(&entry.identity.flatten())?;
        let deps = serde_json::to_string(&entry.deps)?;
        let digest = *entry.identity.digest();
        self.with_immediate_tx(|tx| {
            tx.execute(
                "INSERT INTO materializer_state(path, artifact_type, entry_hash, entry_size, \
                 identity, deps, materialized_at, last_access_time) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT(path) DO UPDATE SET artifact_type=excluded.artifact_type, \
                 entry_hash=excluded.entry_hash, entry_size=excluded.entry_size, \
                 identity=excluded.identity, deps=excluded.deps, \
                 materialized_at=excluded.materialized_at, \
                 last_access_time=excluded.last_access_time",
                params![
                    entry.path.as_str(),
                    entry.identity.kind_tag(),
                    digest.hash_hex(),
                    sql_int(digest.size()),
                    identity,
                    deps,
                    sql_int(entry.stamp.materialized_at),
                    sql_int(entry.stamp.last_accessed),
                ],
            )?;
            Ok(())
        })
    }

    pub(in crate::core::store::state) fn delete(&mut self, path: &ArtifactPath) -> Result<()> {
        self.with_immediate_tx(|tx| {
            tx.execute(
                "DELETE FROM materializer_state WHERE path = ?1",
                params![path.as_str()],
            )?;
            Ok(())
        })
    }

    pub(in crate::core::store::state) fn delete_rows(&mut self, keys: &[String]) -> Result<()> {
        self.with_immediate_tx(|tx| {
            let mut stmt = tx.prepare("DELETE FROM materializer_state WHERE path = ?1")?;
            for key in keys {
                stmt.execute(params![key])?;
            }
            Ok(())
        })
    }

    pub(in crate::core::store::state) fn update_deps(
        &mut self,
        path: &ArtifactPath,
        deps: &BTreeSet<ArtifactPath>,
        now: u64,
    ) -> Result<()> {
        let deps = serde_json::to_string(deps)?;
        self.with_immediate_tx(|tx| {
            tx.execute(
                "UPDATE materializer_state SET deps = ?2, last_access_time = ?3 WHERE path = ?1",
                params![path.as_str(), deps, sql_int(now)],
            )?;
            Ok(())
        })
    }

    pub(in crate::core::store::state) fn update_access_times(
        &mut self,
        batch: &BTreeMap<ArtifactPath, u64>,
    ) -> Result<usize> {
        self.with_immediate_tx(|tx| {
            let mut stmt = tx.prepare(
                "UPDATE materializer_state SET last_access_time = ?2 WHERE path = ?1",
            )?;
            let mut updated = 0;
            for (path, at) in batch {
                updated += stmt.execute(params![path.as_str(), sql_int(*at)])?;
            }
            Ok(updated)
        })
    }
}

fn sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
