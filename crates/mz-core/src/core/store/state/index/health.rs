//! Validation of a durable file found at startup.

use std::collections::HashSet;

use anyhow::Result;
use rusqlite::Connection;

use super::super::{StoreError, SCHEMA_VERSION};
use super::connection::configure;
use super::meta::{
    enforce_meta_value, require_meta_presence, META_KEY_CREATED_BY, META_KEY_MATERIALIZATIONS,
    META_KEY_SCHEMA_VERSION, META_KEY_STATE_VERSION,
};
use super::schema::EXPECTED_TABLES;
use super::StateDb;

impl StateDb {
    pub(in crate::core::store::state) fn validate(&self) -> Result<()> {
        configure(&self.conn)?;
        run_integrity_check(&self.conn)?;
        assert_expected_tables(&self.conn)?;
        enforce_meta_value(
            &self.conn,
            META_KEY_SCHEMA_VERSION,
            &SCHEMA_VERSION.to_string(),
        )?;
        enforce_meta_value(
            &self.conn,
            META_KEY_STATE_VERSION,
            &self.meta.state_version.to_string(),
        )?;
        enforce_meta_value(
            &self.conn,
            META_KEY_MATERIALIZATIONS,
            self.meta.materializations.as_str(),
        )?;
        require_meta_presence(&self.conn, META_KEY_CREATED_BY)?;
        Ok(())
    }
}

fn run_integrity_check(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA integrity_check")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let result: String = row.get(0)?;
        if !result.eq_ignore_ascii_case("ok") {
            return Err(StoreError::Corrupt(result).into());
        }
    }
    Ok(())
}

fn assert_expected_tables(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
    let found = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<HashSet<_>>>()?;
    let missing: Vec<&str> = EXPECTED_TABLES
        .iter()
        .copied()
        .filter(|name| !found.contains(*name))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(StoreError::Corrupt(format!("missing tables: {}", missing.join(", "))).into())
    }
}
