//! Meta table writes + version enforcement.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

use super::super::{StoreError, MZ_VERSION, SCHEMA_VERSION};
use super::StateDb;

pub(super) const META_KEY_SCHEMA_VERSION: &str = "schema_version";
pub(super) const META_KEY_STATE_VERSION: &str = "state_version";
pub(super) const META_KEY_MATERIALIZATIONS: &str = "materializations";
pub(super) const META_KEY_CREATED_BY: &str = "created_by_mz_version";
pub(super) const META_KEY_LAST_USED: &str = "last_used_mz_version";

impl StateDb {
    pub(super) fn write_meta(&mut self) -> Result<()> {
        let rows = [
            (META_KEY_SCHEMA_VERSION, SCHEMA_VERSION.to_string()),
            (META_KEY_STATE_VERSION, self.meta.state_version.to_string()),
            (
                META_KEY_MATERIALIZATIONS,
                self.meta.materializations.as_str().to_string(),
            ),
            (META_KEY_CREATED_BY, MZ_VERSION.to_string()),
            (META_KEY_LAST_USED, MZ_VERSION.to_string()),
        ];
        self.with_immediate_tx(|tx| {
            for (key, value) in &rows {
                tx.execute(
                    "INSERT INTO meta(key, value) VALUES (?1, ?2) \
                     ON CONFLICT(key) DO UPDATE SET value=excluded.value",
                    params![key, value],
                )?;
            }
            Ok(())
        })
    }

    pub(in crate::core::store::state) fn record_last_used(&mut self) -> Result<()> {
        self.with_immediate_tx(|tx| {
            tx.execute(
                "INSERT INTO meta(key, value) VALUES (?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value=excluded.value",
                params![META_KEY_LAST_USED, MZ_VERSION],
            )?;
            Ok(())
        })
    }
}

pub(super) fn meta_value(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM meta WHERE key = ?1",
        params![key],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map_err(Into::into)
}

pub(super) fn enforce_meta_value(conn: &Connection, key: &str, expected: &str) -> Result<()> {
    let found = meta_value(conn, key)?.ok_or_else(|| StoreError::MissingMeta(key.to_string()))?;
    if found != expected {
        return Err(StoreError::IncompatibleFormat {
            key: key.to_string(),
            expected: expected.to_string(),
            found,
        }
        .into());
    }
    Ok(())
}

pub(super) fn require_meta_presence(conn: &Connection, key: &str) -> Result<()> {
    meta_value(conn, key)?.ok_or_else(|| StoreError::MissingMeta(key.to_string()))?;
    Ok(())
}
