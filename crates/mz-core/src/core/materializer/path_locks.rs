//! Per-path single-flight over the output tree.
//!
//! A path is busy while a request holds it. Requests for the same path, an
//! ancestor or a descendant queue until it is released; requests for
//! unrelated paths never wait. Holders are tracked in a set and waiters are
//! woken through a [`Notify`] whenever any path is released.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use mz_domain::ArtifactPath;
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub(crate) struct PathLocks {
    held: Mutex<BTreeSet<ArtifactPath>>,
    released: Notify,
}

/// Exclusive claim on a path and everything above and below it.
#[derive(Debug)]
pub(crate) struct PathGuard<'a> {
    locks: &'a PathLocks,
    path: ArtifactPath,
}

impl PathLocks {
    pub(crate) async fn acquire(&self, path: &ArtifactPath) -> PathGuard<'_> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // register before checking so a release in between is not lost
            notified.as_mut().enable();
            {
                let mut held = self.held();
                if !held.iter().any(|other| overlaps(other, path)) {
                    held.insert(path.clone());
                    return PathGuard {
                        locks: self,
                        path: path.clone(),
                    };
                }
            }
            notified.await;
        }
    }

    fn held(&self) -> MutexGuard<'_, BTreeSet<ArtifactPath>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Paths with a request in flight.
    #[cfg(test)]
    pub(crate) fn active(&self) -> usize {
        self.held().len()
    }
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        self.locks.held().remove(&self.path);
        self.locks.released.notify_waiters();
    }
}

fn overlaps(a: &ArtifactPath, b: &ArtifactPath) -> bool {
    a.starts_with(b) || b.starts_with(a)
}
