//! Blocking filesystem work for materialization. Callers run these on
//! `spawn_blocking`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use mz_domain::{ArtifactIdentity, ArtifactKind, ArtifactPath};
use tracing::trace;

use crate::core::fs::remove_path;
use crate::core::store::ContentStore;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct WriteSummary {
    pub(crate) files: u64,
    pub(crate) bytes: u64,
    pub(crate) replaced: bool,
}

pub(crate) fn absolute(root: &Path, path: &ArtifactPath) -> PathBuf {
    root.join(path.as_path().as_std_path())
}

/// Replaces whatever is at `path` with the content `identity` describes.
pub(crate) fn write_artifact(
    cas: &ContentStore,
    root: &Path,
    path: &ArtifactPath,
    identity: &ArtifactIdentity,
) -> Result<WriteSummary> {
    let dest = absolute(root, path);
    prepare_parent(root, path)?;
    let replaced = remove_path(&dest)?;
    if replaced {
        trace!(%path, "removed stale on-disk content");
    }
    let mut summary = WriteSummary {
        replaced,
        ..WriteSummary::default()
    };
    write_node(cas, &dest, identity, &mut summary)?;
    Ok(summary)
}

/// Removes on-disk content at `path`; `false` when nothing was there.
pub(crate) fn remove_artifact(root: &Path, path: &ArtifactPath) -> Result<bool> {
    remove_path(&absolute(root, path))
}

/// Creates the parent directory chain, replacing any non-directory that sits
/// where a directory is needed.
fn prepare_parent(root: &Path, path: &ArtifactPath) -> Result<()> {
    let Some(parent) = path.as_path().parent() else {
        return Ok(());
    };
    let mut current = root.to_path_buf();
    for component in parent.components() {
        current.push(component.as_str());
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.is_dir() => continue,
            Ok(_) => {
                trace!(path = %current.display(), "replacing non-directory ancestor");
                remove_path(&current)?;
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("failed to stat {}", current.display()))
            }
        }
        match fs::create_dir(&current) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists && current.is_dir() => {}
            Err(err) => {
                return Err(err).with_context(|| format!("failed to create {}", current.display()))
            }
        }
    }
    Ok(())
}

fn write_node(
    cas: &ContentStore,
    dest: &Path,
    identity: &ArtifactIdentity,
    summary: &mut WriteSummary,
) -> Result<()> {
    match identity.kind() {
        ArtifactKind::File { executable } => {
            summary.bytes += write_file(cas, dest, identity, *executable)?;
            summary.files += 1;
        }
        ArtifactKind::Symlink { target } => write_symlink(dest, target)?,
        ArtifactKind::Directory { entries } => {
            fs::create_dir(dest)
                .with_context(|| format!("failed to create directory {}", dest.display()))?;
            for (name, child) in entries {
                write_node(cas, &dest.join(name), child, summary)?;
            }
        }
    }
    Ok(())
}

fn write_file(
    cas: &ContentStore,
    dest: &Path,
    identity: &ArtifactIdentity,
    executable: bool,
) -> Result<u64> {
    let parent = dest
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent directory", dest.display()))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".mz-")
        .tempfile_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    let written = cas.copy_to(identity.digest(), tmp.as_file_mut())?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("failed to flush {}", tmp.path().display()))?;
    set_mode(tmp.path(), executable)?;
    tmp.persist(dest).map_err(|err| {
        anyhow::Error::new(err.error).context(format!("failed to move file into {}", dest.display()))
    })?;
    Ok(written)
}

#[cfg(unix)]
fn set_mode(path: &Path, executable: bool) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o755 } else { 0o644 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _executable: bool) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn write_symlink(dest: &Path, target: &Utf8Path) -> Result<()> {
    std::os::unix::fs::symlink(target.as_std_path(), dest)
        .with_context(|| format!("failed to create symlink {}", dest.display()))
}

#[cfg(windows)]
fn write_symlink(dest: &Path, target: &Utf8Path) -> Result<()> {
    std::os::windows::fs::symlink_file(target.as_std_path(), dest)
        .with_context(|| format!("failed to create symlink {}", dest.display()))
}
