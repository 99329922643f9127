use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::{Digest, IdentityError};

/// Content identity of an artifact: its digest plus structural metadata.
///
/// Identities are built bottom-up from content, so a directory can never
/// contain itself. Equality compares root digests first and only descends
/// into children when they agree.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "RawIdentity")]
pub struct ArtifactIdentity {
    digest: Digest,
    kind: ArtifactKind,
}

/// Structural kind of an artifact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ArtifactKind {
    File {
        #[serde(default)]
        executable: bool,
    },
    Symlink {
        target: Utf8PathBuf,
    },
    Directory {
        entries: BTreeMap<String, ArtifactIdentity>,
    },
}

impl ArtifactIdentity {
    #[must_use]
    pub fn file(bytes: &[u8], executable: bool) -> Self {
        Self::file_with_digest(Digest::of_bytes(bytes), executable)
    }

    /// File identity for content that lives elsewhere (e.g. in the content store).
    #[must_use]
    pub fn file_with_digest(digest: Digest, executable: bool) -> Self {
        Self {
            digest,
            kind: ArtifactKind::File { executable },
        }
    }

    pub fn symlink(target: impl Into<Utf8PathBuf>) -> Result<Self, IdentityError> {
        let target = target.into();
        if target.as_str().is_empty() {
            return Err(IdentityError::EmptySymlinkTarget);
        }
        Ok(Self {
            digest: Digest::of_bytes(target.as_str().as_bytes()),
            kind: ArtifactKind::Symlink { target },
        })
    }

    pub fn directory<I>(entries: I) -> Result<Self, IdentityError>
    where
        I: IntoIterator<Item = (String, ArtifactIdentity)>,
    {
        let entries: BTreeMap<String, ArtifactIdentity> = entries.into_iter().collect();
        for name in entries.keys() {
            validate_entry_name(name)?;
        }
        Ok(Self {
            digest: directory_digest(&entries),
            kind: ArtifactKind::Directory { entries },
        })
    }

    #[must_use]
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    #[must_use]
    pub fn kind(&self) -> &ArtifactKind {
        &self.kind
    }

    #[must_use]
    pub fn kind_tag(&self) -> &'static str {
        self.kind.tag()
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        matches!(self.kind, ArtifactKind::Directory { .. })
    }

    /// Every file in the tree, keyed by its path relative to this artifact.
    ///
    /// A plain file yields a single entry with an empty relative path.
    #[must_use]
    pub fn files(&self) -> Vec<(Utf8PathBuf, Digest, bool)> {
        let mut out = Vec::new();
        self.collect_files(Utf8Path::new(""), &mut out);
        out
    }

    fn collect_files(&self, prefix: &Utf8Path, out: &mut Vec<(Utf8PathBuf, Digest, bool)>) {
        match &self.kind {
            ArtifactKind::File { executable } => {
                out.push((prefix.to_path_buf(), self.digest, *executable));
            }
            ArtifactKind::Symlink { .. } => {}
            ArtifactKind::Directory { entries } => {
                for (name, child) in entries {
                    child.collect_files(&prefix.join(name), out);
                }
            }
        }
    }
}

impl PartialEq for ArtifactIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest && self.kind == other.kind
    }
}

impl Eq for ArtifactIdentity {}

impl ArtifactKind {
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::File { executable: false } => "file",
            Self::File { executable: true } => "executable-file",
            Self::Symlink { .. } => "symlink",
            Self::Directory { .. } => "directory",
        }
    }
}

fn validate_entry_name(name: &str) -> Result<(), IdentityError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(IdentityError::InvalidEntryName(name.to_string()));
    }
    Ok(())
}

fn directory_digest(entries: &BTreeMap<String, ArtifactIdentity>) -> Digest {
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    for (name, child) in entries {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(child.kind_tag().as_bytes());
        hasher.update([0u8]);
        hasher.update(child.digest.sha256());
        hasher.update(child.digest.size().to_le_bytes());
        size = size.saturating_add(child.digest.size());
    }
    Digest::from_sha256(hasher.finalize().into(), size)
}

/// One node of a tree laid out flat, keyed by its path below the root.
///
/// The root itself has an empty path. Directories carry no children here;
/// they are implied by the paths of the other nodes, so the encoded form
/// does not nest however deep the tree goes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatNode {
    pub path: Utf8PathBuf,
    #[serde(flatten)]
    pub kind: FlatKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FlatKind {
    File {
        digest: Digest,
        #[serde(default)]
        executable: bool,
    },
    Symlink {
        target: Utf8PathBuf,
    },
    Directory,
}

impl ArtifactIdentity {
    /// Lists every node of the tree, parents before children.
    #[must_use]
    pub fn flatten(&self) -> Vec<FlatNode> {
        let mut out = Vec::new();
        self.flatten_into(Utf8PathBuf::new(), &mut out);
        out
    }

    fn flatten_into(&self, path: Utf8PathBuf, out: &mut Vec<FlatNode>) {
        let kind = match &self.kind {
            ArtifactKind::File { executable } => FlatKind::File {
                digest: self.digest,
                executable: *executable,
            },
            ArtifactKind::Symlink { target } => FlatKind::Symlink {
                target: target.clone(),
            },
            ArtifactKind::Directory { .. } => FlatKind::Directory,
        };
        out.push(FlatNode {
            path: path.clone(),
            kind,
        });
        if let ArtifactKind::Directory { entries } = &self.kind {
            for (name, child) in entries {
                child.flatten_into(path.join(name), out);
            }
        }
    }

    /// Rebuilds a tree from [`ArtifactIdentity::flatten`] output. Directory
    /// digests are recomputed, so nodes in any order give the same result.
    pub fn from_flat(nodes: impl IntoIterator<Item = FlatNode>) -> Result<Self, IdentityError> {
        let mut kinds = BTreeMap::new();
        for node in nodes {
            if kinds.insert(node.path.clone(), node.kind).is_some() {
                return Err(IdentityError::MalformedTree(format!(
                    "'{}' appears twice",
                    node.path
                )));
            }
        }
        let mut order: Vec<Utf8PathBuf> = kinds.keys().cloned().collect();
        order.sort_by_key(|path| std::cmp::Reverse(path.components().count()));

        let mut children: BTreeMap<Utf8PathBuf, BTreeMap<String, ArtifactIdentity>> =
            BTreeMap::new();
        let mut root = None;
        for path in order {
            let Some(kind) = kinds.remove(&path) else {
                continue;
            };
            let identity = match kind {
                FlatKind::File { digest, executable } => Self::file_with_digest(digest, executable),
                FlatKind::Symlink { target } => Self::symlink(target)?,
                FlatKind::Directory => {
                    Self::directory(children.remove(&path).unwrap_or_default())?
                }
            };
            if path.as_str().is_empty() {
                root = Some(identity);
                continue;
            }
            let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
                return Err(IdentityError::MalformedTree(format!("bad node path '{path}'")));
            };
            children
                .entry(parent.to_path_buf())
                .or_default()
                .insert(name.to_string(), identity);
        }
        if let Some(orphan) = children.keys().next() {
            return Err(IdentityError::MalformedTree(format!(
                "'{orphan}' is not a directory node"
            )));
        }
        root.ok_or_else(|| IdentityError::MalformedTree("no root node".to_string()))
    }
}

/// Wire shape accepted on deserialization; derived digests are recomputed.
#[derive(Deserialize)]
struct RawIdentity {
    #[serde(default)]
    digest: Option<Digest>,
    kind: ArtifactKind,
}

impl TryFrom<RawIdentity> for ArtifactIdentity {
    type Error = IdentityError;

    fn try_from(raw: RawIdentity) -> Result<Self, Self::Error> {
        let rebuilt = match raw.kind {
            ArtifactKind::File { executable } => {
                let digest = raw.digest.ok_or_else(|| {
                    IdentityError::MalformedDigest("file identity without digest".to_string())
                })?;
                return Ok(Self::file_with_digest(digest, executable));
            }
            ArtifactKind::Symlink { target } => Self::symlink(target)?,
            ArtifactKind::Directory { entries } => Self::directory(entries)?,
        };
        if let Some(declared) = raw.digest {
            if declared != rebuilt.digest {
                return Err(IdentityError::MalformedDigest(declared.to_string()));
            }
        }
        Ok(rebuilt)
    }
}
