use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{ArtifactIdentity, ArtifactPath};

/// When an entry was materialized and last consulted, in unix seconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryStamp {
    pub materialized_at: u64,
    pub last_accessed: u64,
}

impl EntryStamp {
    #[must_use]
    pub fn at(now: u64) -> Self {
        Self {
            materialized_at: now,
            last_accessed: now,
        }
    }
}

/// What the materializer last wrote at a path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializedEntry {
    pub path: ArtifactPath,
    pub identity: ArtifactIdentity,
    #[serde(default)]
    pub deps: BTreeSet<ArtifactPath>,
    pub stamp: EntryStamp,
}

impl MaterializedEntry {
    #[must_use]
    pub fn new(
        path: ArtifactPath,
        identity: ArtifactIdentity,
        deps: BTreeSet<ArtifactPath>,
        now: u64,
    ) -> Self {
        Self {
            path,
            identity,
            deps,
            stamp: EntryStamp::at(now),
        }
    }

    /// Same identity as `declared`; the on-disk content can be reused.
    #[must_use]
    pub fn matches(&self, declared: &ArtifactIdentity) -> bool {
        self.identity == *declared
    }
}
