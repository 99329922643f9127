//! `.mzconfig` parsing.
//!
//! The file is TOML with a single `[materializer]` table. Values may be
//! written natively (`true`, `3`) or as strings (`"true"`, `"3"`) so configs
//! copied from ini-style build files keep working.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use toml_edit::{DocumentMut, Item, TableLike};

pub const CONFIG_FILENAME: &str = ".mzconfig";
const SECTION: &str = "materializer";

/// Raw values found in the config file; `None` means "not set".
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct FileSettings {
    pub(crate) materializations: Option<String>,
    pub(crate) sqlite_materializer_state: Option<bool>,
    pub(crate) sqlite_materializer_state_version: Option<u32>,
    pub(crate) hash_all_commands: Option<bool>,
    pub(crate) deps_policy: Option<String>,
    pub(crate) access_time_flush_threshold: Option<usize>,
    pub(crate) clean_stale_ttl_secs: Option<u64>,
}

impl FileSettings {
    pub(crate) fn load(build_root: &Path) -> Result<Self> {
        let path = build_root.join(CONFIG_FILENAME);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        Self::parse(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub(crate) fn parse(contents: &str) -> Result<Self> {
        let doc: DocumentMut = contents.parse().context("invalid TOML")?;
        let Some(table) = doc.get(SECTION).and_then(Item::as_table_like) else {
            return Ok(Self::default());
        };
        Ok(Self {
            materializations: string_value(table, "materializations")?,
            sqlite_materializer_state: bool_value(table, "sqlite_materializer_state")?,
            sqlite_materializer_state_version: int_value(
                table,
                "sqlite_materializer_state_version",
            )?,
            hash_all_commands: bool_value(table, "hash_all_commands")?,
            deps_policy: string_value(table, "deps_policy")?,
            access_time_flush_threshold: int_value(table, "access_time_flush_threshold")?,
            clean_stale_ttl_secs: int_value(table, "clean_stale_ttl_secs")?,
        })
    }
}

fn string_value(table: &dyn TableLike, key: &str) -> Result<Option<String>> {
    match table.get(key) {
        None => Ok(None),
        Some(item) => item
            .as_str()
            .map(|value| Some(value.trim().to_string()))
            .ok_or_else(|| anyhow!("[{SECTION}] {key} must be a string")),
    }
}

fn bool_value(table: &dyn TableLike, key: &str) -> Result<Option<bool>> {
    let Some(item) = table.get(key) else {
        return Ok(None);
    };
    if let Some(value) = item.as_bool() {
        return Ok(Some(value));
    }
    match item.as_str() {
        Some(raw) => parse_bool(raw)
            .map(Some)
            .ok_or_else(|| anyhow!("[{SECTION}] {key} must be a boolean, found '{raw}'")),
        None => bail!("[{SECTION}] {key} must be a boolean"),
    }
}

fn int_value<T: TryFrom<i64>>(table: &dyn TableLike, key: &str) -> Result<Option<T>> {
    let Some(item) = table.get(key) else {
        return Ok(None);
    };
    let raw = if let Some(value) = item.as_integer() {
        value
    } else if let Some(text) = item.as_str() {
        text.trim()
            .parse::<i64>()
            .map_err(|_| anyhow!("[{SECTION}] {key} must be an integer, found '{text}'"))?
    } else {
        bail!("[{SECTION}] {key} must be an integer");
    };
    T::try_from(raw)
        .map(Some)
        .map_err(|_| anyhow!("[{SECTION}] {key} is out of range: {raw}"))
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
