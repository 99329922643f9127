use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

use crate::IdentityError;

/// SHA-256 content hash plus the declared size of the content it covers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    sha256: [u8; 32],
    size: u64,
}

impl Digest {
    #[must_use]
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self {
            sha256: Sha256::digest(bytes).into(),
            size: bytes.len() as u64,
        }
    }

    /// Digest for `bytes`, rejecting a declared size that disagrees with the content.
    pub fn of_bytes_declared(bytes: &[u8], declared_size: u64) -> Result<Self, IdentityError> {
        let actual = bytes.len() as u64;
        if actual != declared_size {
            return Err(IdentityError::SizeMismatch {
                declared: declared_size,
                actual,
            });
        }
        Ok(Self::of_bytes(bytes))
    }

    #[must_use]
    pub fn from_sha256(sha256: [u8; 32], size: u64) -> Self {
        Self { sha256, size }
    }

    /// Rebuild a digest from a hex hash and size as reported by an external producer.
    pub fn from_parts(hash_hex: Option<&str>, size: u64) -> Result<Self, IdentityError> {
        let Some(hash_hex) = hash_hex else {
            if size == 0 {
                return Ok(Self::of_bytes(&[]));
            }
            return Err(IdentityError::SizeWithoutContent { size });
        };
        let mut sha256 = [0u8; 32];
        hex::decode_to_slice(hash_hex, &mut sha256)
            .map_err(|_| IdentityError::MalformedDigest(hash_hex.to_string()))?;
        Ok(Self { sha256, size })
    }

    #[must_use]
    pub fn sha256(&self) -> &[u8; 32] {
        &self.sha256
    }

    #[must_use]
    pub fn hash_hex(&self) -> String {
        hex::encode(self.sha256)
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hash_hex(), self.size)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

impl FromStr for Digest {
    type Err = IdentityError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (hash, size) = value
            .split_once(':')
            .ok_or_else(|| IdentityError::MalformedDigest(value.to_string()))?;
        let size = size
            .parse::<u64>()
            .map_err(|_| IdentityError::MalformedDigest(value.to_string()))?;
        if hash.is_empty() {
            return Self::from_parts(None, size);
        }
        Self::from_parts(Some(hash), size)
            .map_err(|_| IdentityError::MalformedDigest(value.to_string()))
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}
