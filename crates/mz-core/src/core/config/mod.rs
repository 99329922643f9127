use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

mod settings;

pub(crate) use settings::parse_bool;
use settings::FileSettings;
pub use settings::CONFIG_FILENAME;

const DEFAULT_ACCESS_TIME_FLUSH_THRESHOLD: usize = 256;
const DEFAULT_CLEAN_STALE_TTL_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Clone, Debug, Default)]
pub(crate) struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub(crate) fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}

/// Backend strategy used to realize artifacts on disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MaterializationMethod {
    #[default]
    Deferred,
    Eden,
}

impl MaterializationMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deferred => "deferred",
            Self::Eden => "eden",
        }
    }

    /// Whether a virtualized filesystem service exists on this platform.
    #[must_use]
    pub fn is_supported(self) -> bool {
        match self {
            Self::Deferred => true,
            Self::Eden => cfg!(target_os = "linux"),
        }
    }
}

impl fmt::Display for MaterializationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MaterializationMethod {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "deferred" => Ok(Self::Deferred),
            "eden" => Ok(Self::Eden),
            other => Err(anyhow!(
                "unknown materializations value '{other}' (expected deferred or eden)"
            )),
        }
    }
}

/// How an identity match with different dependency paths is handled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DepsPolicy {
    /// Every identity match rewrites the recorded deps.
    #[default]
    Record,
    /// Identical deps take a pure skip; only differing deps are rewritten.
    Compare,
}

impl DepsPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Record => "record",
            Self::Compare => "compare",
        }
    }
}

impl FromStr for DepsPolicy {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "record" => Ok(Self::Record),
            "compare" => Ok(Self::Compare),
            other => Err(anyhow!(
                "unknown deps_policy value '{other}' (expected record or compare)"
            )),
        }
    }
}

/// Effective materializer settings for one daemon lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MaterializerConfig {
    pub build_root: PathBuf,
    pub materializations: MaterializationMethod,
    pub sqlite_materializer_state: bool,
    pub sqlite_materializer_state_version: u32,
    pub hash_all_commands: bool,
    pub deps_policy: DepsPolicy,
    pub access_time_flush_threshold: usize,
    pub clean_stale_ttl_secs: u64,
}

impl MaterializerConfig {
    /// Built-in defaults rooted at `build_root`, ignoring files and env.
    #[must_use]
    pub fn with_defaults(build_root: impl Into<PathBuf>) -> Self {
        Self {
            build_root: build_root.into(),
            materializations: MaterializationMethod::Deferred,
            sqlite_materializer_state: true,
            sqlite_materializer_state_version: 0,
            hash_all_commands: false,
            deps_policy: DepsPolicy::Record,
            access_time_flush_threshold: DEFAULT_ACCESS_TIME_FLUSH_THRESHOLD,
            clean_stale_ttl_secs: DEFAULT_CLEAN_STALE_TTL_SECS,
        }
    }

    /// Loads `<build_root>/.mzconfig` and applies `MZ_*` environment overrides.
    pub fn load(build_root: &Path) -> Result<Self> {
        let snapshot = EnvSnapshot::capture();
        Self::from_snapshot(build_root, &snapshot)
    }

    pub(crate) fn from_snapshot(build_root: &Path, snapshot: &EnvSnapshot) -> Result<Self> {
        let file = FileSettings::load(build_root)?;
        let mut config = Self::with_defaults(build_root);
        config.apply_file(file)?;
        config.apply_env(snapshot)?;
        Ok(config)
    }

    fn apply_file(&mut self, file: FileSettings) -> Result<()> {
        if let Some(raw) = file.materializations {
            self.materializations = raw.parse()?;
        }
        if let Some(value) = file.sqlite_materializer_state {
            self.sqlite_materializer_state = value;
        }
        if let Some(value) = file.sqlite_materializer_state_version {
            self.sqlite_materializer_state_version = value;
        }
        if let Some(value) = file.hash_all_commands {
            self.hash_all_commands = value;
        }
        if let Some(raw) = file.deps_policy {
            self.deps_policy = raw.parse()?;
        }
        if let Some(value) = file.access_time_flush_threshold {
            self.access_time_flush_threshold = value;
        }
        if let Some(value) = file.clean_stale_ttl_secs {
            self.clean_stale_ttl_secs = value;
        }
        Ok(())
    }

    fn apply_env(&mut self, snapshot: &EnvSnapshot) -> Result<()> {
        if let Some(raw) = snapshot.var("MZ_MATERIALIZATIONS") {
            self.materializations = raw.parse().context("invalid MZ_MATERIALIZATIONS")?;
        }
        if let Some(raw) = snapshot.var("MZ_SQLITE_MATERIALIZER_STATE") {
            self.sqlite_materializer_state = parse_bool(raw)
                .ok_or_else(|| anyhow!("invalid MZ_SQLITE_MATERIALIZER_STATE '{raw}'"))?;
        }
        if let Some(raw) = snapshot.var("MZ_SQLITE_MATERIALIZER_STATE_VERSION") {
            self.sqlite_materializer_state_version = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid MZ_SQLITE_MATERIALIZER_STATE_VERSION '{raw}'"))?;
        }
        if let Some(raw) = snapshot.var("MZ_HASH_ALL_COMMANDS") {
            self.hash_all_commands =
                parse_bool(raw).ok_or_else(|| anyhow!("invalid MZ_HASH_ALL_COMMANDS '{raw}'"))?;
        }
        if let Some(raw) = snapshot.var("MZ_DEPS_POLICY") {
            self.deps_policy = raw.parse().context("invalid MZ_DEPS_POLICY")?;
        }
        Ok(())
    }

    #[must_use]
    pub fn build_root(&self) -> &Path {
        &self.build_root
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serial_test::serial;

    use super::*;

    #[test]
    fn defaults_without_file_or_env() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let config = MaterializerConfig::from_snapshot(temp.path(), &EnvSnapshot::default())?;
        assert_eq!(config, MaterializerConfig::with_defaults(temp.path()));
        assert!(config.sqlite_materializer_state);
        assert_eq!(config.materializations, MaterializationMethod::Deferred);
        Ok(())
    }

    #[test]
    fn env_overrides_file_values() -> Result<()> {
        let temp = tempfile::tempdir()?;
        fs::write(
            temp.path().join(CONFIG_FILENAME),
            "[materializer]\nsqlite_materializer_state = false\nsqlite_materializer_state_version = 2\n",
        )?;
        let snapshot = EnvSnapshot::testing(&[
            ("MZ_SQLITE_MATERIALIZER_STATE_VERSION", "5"),
            ("MZ_DEPS_POLICY", "compare"),
        ]);
        let config = MaterializerConfig::from_snapshot(temp.path(), &snapshot)?;
        assert!(!config.sqlite_materializer_state);
        assert_eq!(config.sqlite_materializer_state_version, 5);
        assert_eq!(config.deps_policy, DepsPolicy::Compare);
        Ok(())
    }

    #[test]
    fn empty_env_values_are_ignored() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let snapshot = EnvSnapshot::testing(&[("MZ_MATERIALIZATIONS", "  ")]);
        let config = MaterializerConfig::from_snapshot(temp.path(), &snapshot)?;
        assert_eq!(config.materializations, MaterializationMethod::Deferred);
        Ok(())
    }

    #[test]
    fn unknown_strategy_is_a_config_error() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let snapshot = EnvSnapshot::testing(&[("MZ_MATERIALIZATIONS", "overlay")]);
        let err = MaterializerConfig::from_snapshot(temp.path(), &snapshot)
            .expect_err("overlay is not a strategy");
        assert!(format!("{err:#}").contains("overlay"));
        Ok(())
    }

    #[test]
    #[serial]
    fn load_captures_process_env() -> Result<()> {
        let temp = tempfile::tempdir()?;
        env::set_var("MZ_DEPS_POLICY", "compare");
        let loaded = MaterializerConfig::load(temp.path());
        env::remove_var("MZ_DEPS_POLICY");
        assert_eq!(loaded?.deps_policy, DepsPolicy::Compare);
        Ok(())
    }

    #[test]
    fn eden_support_tracks_platform() {
        assert!(MaterializationMethod::Deferred.is_supported());
        assert_eq!(
            MaterializationMethod::Eden.is_supported(),
            cfg!(target_os = "linux")
        );
    }
}
