use anyhow::{Context, Result};

use super::StateDb;

pub(super) const EXPECTED_TABLES: [&str; 2] = ["meta", "materializer_state"];

impl StateDb {
    pub(super) fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS materializer_state (
                path TEXT PRIMARY KEY,
                artifact_type TEXT NOT NULL,
                entry_hash TEXT NOT NULL,
                entry_size INTEGER NOT NULL,
                identity TEXT NOT NULL,
                deps TEXT NOT NULL,
                materialized_at INTEGER NOT NULL,
                last_access_time INTEGER NOT NULL
            );
            "#,
            )
            .context("failed to initialize materializer state schema")?;
        Ok(())
    }
}
