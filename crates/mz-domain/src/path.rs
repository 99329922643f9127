use std::fmt;
use std::str::FromStr;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::IdentityError;

/// Path of an artifact relative to the build root.
///
/// Always relative, free of `.`/`..` components and never empty, so it can be
/// used as a store key and joined onto the root without escaping it.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactPath(Utf8PathBuf);

impl ArtifactPath {
    pub fn new(raw: impl AsRef<str>) -> Result<Self, IdentityError> {
        let raw = raw.as_ref();
        let candidate = Utf8Path::new(raw);
        let mut normalized = Utf8PathBuf::new();
        for component in candidate.components() {
            match component {
                Utf8Component::Normal(part) => normalized.push(part),
                Utf8Component::CurDir => {}
                Utf8Component::ParentDir | Utf8Component::RootDir | Utf8Component::Prefix(_) => {
                    return Err(IdentityError::InvalidPath(raw.to_string()));
                }
            }
        }
        if normalized.as_str().is_empty() {
            return Err(IdentityError::InvalidPath(raw.to_string()));
        }
        Ok(Self(normalized))
    }

    #[must_use]
    pub fn as_path(&self) -> &Utf8Path {
        &self.0
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Whether `self` is `other` or lives underneath it.
    #[must_use]
    pub fn starts_with(&self, other: &ArtifactPath) -> bool {
        self.0.starts_with(&other.0)
    }
}

impl fmt::Display for ArtifactPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl fmt::Debug for ArtifactPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0.as_str())
    }
}

impl FromStr for ArtifactPath {
    type Err = IdentityError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::new(value)
    }
}

impl TryFrom<String> for ArtifactPath {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ArtifactPath> for String {
    fn from(value: ArtifactPath) -> Self {
        value.0.into_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_current_dir_components() -> anyhow::Result<()> {
        let path = ArtifactPath::new("./out/./copy.txt")?;
        assert_eq!(path.as_str(), "out/copy.txt");
        Ok(())
    }

    #[test]
    fn rejects_escaping_and_absolute_paths() {
        for raw in ["", ".", "../x", "out/../../x", "/abs/path"] {
            assert_eq!(
                ArtifactPath::new(raw),
                Err(IdentityError::InvalidPath(raw.to_string())),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn prefix_checks_follow_components() -> anyhow::Result<()> {
        let dir = ArtifactPath::new("out/dir")?;
        assert!(ArtifactPath::new("out/dir/file")?.starts_with(&dir));
        assert!(!ArtifactPath::new("out/directory")?.starts_with(&dir));
        Ok(())
    }
}
