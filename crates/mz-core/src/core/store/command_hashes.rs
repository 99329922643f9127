//! Record of the command lines that produced materialized artifacts.
//!
//! Each command is keyed by the SHA-256 of its argv (joined with NUL) and
//! stored as a small JSON record under `<2-hex shard>/<hash>.json`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use mz_domain::ArtifactPath;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tracing::trace;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub hash: String,
    pub argv: Vec<String>,
    pub path: ArtifactPath,
    pub recorded_at: u64,
}

#[derive(Clone, Debug)]
pub struct CommandHashStore {
    root: PathBuf,
}

impl CommandHashStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create {}", root.display()))?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn hash_command(argv: &[String]) -> String {
        let mut hasher = Sha256::new();
        for (idx, arg) in argv.iter().enumerate() {
            if idx > 0 {
                hasher.update([0u8]);
            }
            hasher.update(arg.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Records `argv` as the producer of `path`, returning the command hash.
    pub fn record(&self, path: &ArtifactPath, argv: &[String], now: u64) -> Result<String> {
        let hash = Self::hash_command(argv);
        let record = CommandRecord {
            hash: hash.clone(),
            argv: argv.to_vec(),
            path: path.clone(),
            recorded_at: now,
        };
        let dest = self.record_path(&hash);
        let parent = dest
            .parent()
            .map_or_else(|| self.root.clone(), Path::to_path_buf);
        fs::create_dir_all(&parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
        serde_json::to_writer_pretty(&mut tmp, &record)?;
        tmp.persist(&dest)
            .map_err(|err| anyhow::Error::new(err.error))
            .with_context(|| format!("failed to write {}", dest.display()))?;
        trace!(%path, %hash, "recorded command hash");
        Ok(hash)
    }

    pub fn lookup(&self, hash: &str) -> Result<Option<CommandRecord>> {
        let path = self.record_path(hash);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(
                serde_json::from_slice(&bytes)
                    .with_context(|| format!("failed to decode {}", path.display()))?,
            )),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    fn record_path(&self, hash: &str) -> PathBuf {
        let shard = hash.get(0..2).unwrap_or("xx");
        self.root.join(shard).join(format!("{hash}.json"))
    }
}
