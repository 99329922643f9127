use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use mz_domain::ArtifactIdentity;
use tracing::trace;

use super::ContentStore;

impl ContentStore {
    /// Stores every file under `path` and returns the identity of the tree.
    ///
    /// Symlinks are recorded as links, never followed.
    pub fn ingest_path(&self, path: &Path) -> Result<ArtifactIdentity> {
        let meta = fs::symlink_metadata(path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        let file_type = meta.file_type();
        if file_type.is_symlink() {
            let target = fs::read_link(path)
                .with_context(|| format!("failed to read link {}", path.display()))?;
            let target = target
                .to_str()
                .ok_or_else(|| anyhow!("symlink target of {} is not UTF-8", path.display()))?;
            return Ok(ArtifactIdentity::symlink(target)?);
        }
        if file_type.is_dir() {
            let mut children = Vec::new();
            for entry in fs::read_dir(path)
                .with_context(|| format!("failed to list {}", path.display()))?
            {
                let entry = entry?;
                let name = entry
                    .file_name()
                    .into_string()
                    .map_err(|raw| anyhow!("entry name {raw:?} is not UTF-8"))?;
                children.push((name, self.ingest_path(&entry.path())?));
            }
            let identity = ArtifactIdentity::directory(children)?;
            trace!(path = %path.display(), digest = %identity.digest(), "ingested directory");
            return Ok(identity);
        }
        if file_type.is_file() {
            let digest = self.put_file(path)?;
            trace!(path = %path.display(), %digest, "ingested file");
            return Ok(ArtifactIdentity::file_with_digest(
                digest,
                is_executable(&meta),
            ));
        }
        Err(anyhow!("unsupported file type at {}", path.display()))
    }
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}
