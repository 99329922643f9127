use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use mz_domain::Digest;
use sha2::{Digest as _, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::{
    hash_reader, remove_write_permissions, write_error, CasError, ContentStore, COPY_BUF_SIZE,
    PARTIAL_SUFFIX,
};
use crate::core::fs::{fsync_dir, make_writable_recursive};

impl ContentStore {
    /// Stores `bytes`, returning their digest. Existing objects are verified
    /// and reused.
    pub fn put_bytes(&self, bytes: &[u8]) -> Result<Digest> {
        let digest = Digest::of_bytes(bytes);
        if self.is_present(&digest)? {
            debug!(oid = %digest.hash_hex(), "cas hit");
            return Ok(digest);
        }
        let mut tmp = self.partial_file()?;
        tmp.write_all(bytes)
            .with_context(|| format!("failed to write {}", tmp.path().display()))
            .map_err(write_error)?;
        self.install(tmp, &digest).map_err(write_error)?;
        Ok(digest)
    }

    /// Streams the file at `path` into the store in a single pass.
    pub fn put_file(&self, path: &Path) -> Result<Digest> {
        let mut source =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mut tmp = self.partial_file()?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        let mut size = 0u64;
        loop {
            let read = source
                .read(&mut buf)
                .with_context(|| format!("failed to read {}", path.display()))?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
            tmp.write_all(&buf[..read])
                .with_context(|| format!("failed to write {}", tmp.path().display()))
                .map_err(write_error)?;
            size += read as u64;
        }
        let digest = Digest::from_sha256(hasher.finalize().into(), size);
        if self.is_present(&digest)? {
            debug!(oid = %digest.hash_hex(), "cas hit");
            return Ok(digest);
        }
        self.install(tmp, &digest).map_err(write_error)?;
        Ok(digest)
    }

    /// Reads and verifies an object.
    pub fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.object_path(digest);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(CasError::MissingObject {
                    digest: digest.to_string(),
                }
                .into())
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        let actual = Digest::of_bytes(&bytes);
        if actual != *digest {
            return Err(CasError::DigestMismatch {
                digest: digest.to_string(),
                actual: actual.to_string(),
            }
            .into());
        }
        Ok(bytes)
    }

    /// Copies an object into `writer`, verifying the digest as it streams.
    ///
    /// On mismatch the writer has already received the corrupt bytes; callers
    /// must discard it.
    pub fn copy_to(&self, digest: &Digest, writer: &mut impl Write) -> Result<u64> {
        let path = self.object_path(digest);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(CasError::MissingObject {
                    digest: digest.to_string(),
                }
                .into())
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to open {}", path.display()))
            }
        };
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        let mut size = 0u64;
        loop {
            let read = file
                .read(&mut buf)
                .with_context(|| format!("failed to read {}", path.display()))?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
            writer.write_all(&buf[..read])?;
            size += read as u64;
        }
        let actual = Digest::from_sha256(hasher.finalize().into(), size);
        if actual != *digest {
            return Err(CasError::DigestMismatch {
                digest: digest.to_string(),
                actual: actual.to_string(),
            }
            .into());
        }
        Ok(size)
    }

    pub(crate) fn verify_existing(&self, digest: &Digest, path: &Path) -> Result<()> {
        let mut file = File::open(path)
            .with_context(|| format!("failed to open existing object {}", path.display()))?;
        let actual = hash_reader(&mut file)
            .with_context(|| format!("failed to read existing object {}", path.display()))?;
        if actual != *digest {
            return Err(CasError::DigestMismatch {
                digest: digest.to_string(),
                actual: actual.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Whether a verified copy of `digest` already exists. Corrupt copies are
    /// removed so the caller rewrites them.
    fn is_present(&self, digest: &Digest) -> Result<bool> {
        let path = self.object_path(digest);
        if !path.exists() {
            return Ok(false);
        }
        match self.verify_existing(digest, &path) {
            Ok(()) => Ok(true),
            Err(err) if err.is::<CasError>() => {
                warn!(path = %path.display(), error = %err, "replacing corrupt object");
                make_writable_recursive(&path);
                fs::remove_file(&path)
                    .with_context(|| format!("failed to remove corrupt {}", path.display()))?;
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    fn partial_file(&self) -> Result<NamedTempFile> {
        tempfile::Builder::new()
            .prefix("obj-")
            .suffix(PARTIAL_SUFFIX)
            .tempfile_in(self.tmp_dir())
            .context("failed to create partial object")
            .map_err(write_error)
    }

    fn install(&self, tmp: NamedTempFile, digest: &Digest) -> Result<()> {
        let oid = digest.hash_hex();
        tmp.as_file()
            .sync_all()
            .with_context(|| format!("failed to flush {}", tmp.path().display()))?;

        let dest = self.object_path(digest);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create object directory {}", parent.display())
            })?;
        }

        let _lock = self.acquire_lock(&oid)?;
        if dest.exists() && self.verify_existing(digest, &dest).is_ok() {
            debug!(%oid, "cas hit");
            return Ok(());
        }
        tmp.persist(&dest).map_err(|err| {
            anyhow::Error::new(err.error).context(format!(
                "failed to move object into place at {}",
                dest.display()
            ))
        })?;
        if let Some(parent) = dest.parent() {
            fsync_dir(parent).ok();
        }
        remove_write_permissions(&dest)
            .with_context(|| format!("failed to harden {}", dest.display()))?;
        debug!(%oid, size = digest.size(), "cas store");
        Ok(())
    }
}
