use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use mz_domain::{ArtifactIdentity, ArtifactPath};
use tempfile::TempDir;

use super::*;
use crate::core::store::StateStore;

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("capture buffer").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Captured {
    fn count(&self, needle: &str) -> usize {
        let bytes = self.0.lock().expect("capture buffer").clone();
        String::from_utf8_lossy(&bytes).matches(needle).count()
    }
}

fn capture_traces() -> (Captured, tracing::subscriber::DefaultGuard) {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    (captured, tracing::subscriber::set_default(subscriber))
}

struct Harness {
    _temp: TempDir,
    root: PathBuf,
    cas: ContentStore,
    state: Arc<StateStore>,
}

impl Harness {
    fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let root = temp.path().join("root");
        fs::create_dir_all(&root)?;
        let cas = ContentStore::open(temp.path().join("cas"))?;
        Ok(Self {
            _temp: temp,
            root,
            cas,
            state: Arc::new(StateStore::in_memory(16)),
        })
    }

    fn context(&self, deps_policy: DepsPolicy) -> MaterializerContext {
        MaterializerContext {
            root: self.root.clone(),
            cas: self.cas.clone(),
            deps_policy,
            reserved: vec![path("mz-out/cache"), path("mz-out/cas")],
        }
    }

    fn deferred(&self, deps_policy: DepsPolicy) -> DeferredMaterializer {
        DeferredMaterializer::new(self.context(deps_policy), Arc::clone(&self.state))
    }

    fn file(&self, bytes: &[u8]) -> Result<ArtifactIdentity> {
        Ok(ArtifactIdentity::file_with_digest(
            self.cas.put_bytes(bytes)?,
            false,
        ))
    }

    fn read(&self, raw: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.root.join(raw))?)
    }

    fn drop_object(&self, identity: &ArtifactIdentity) -> Result<()> {
        let object = self.cas.object_path(identity.digest());
        crate::core::fs::make_writable_recursive(&object);
        fs::remove_file(object)?;
        Ok(())
    }
}

fn path(raw: &str) -> ArtifactPath {
    ArtifactPath::new(raw).expect("valid artifact path")
}

fn deps(raws: &[&str]) -> BTreeSet<ArtifactPath> {
    raws.iter().map(|raw| path(raw)).collect()
}

#[tokio::test]
async fn matching_identity_updates_deps_without_rewriting() -> Result<()> {
    let (traces, _guard) = capture_traces();
    let h = Harness::new()?;
    let materializer = h.deferred(DepsPolicy::Record);
    let identity = h.file(b"payload")?;

    let first = materializer
        .request_materialize(path("out/a.txt"), identity.clone(), deps(&["src/a"]))
        .await?;
    assert_eq!(first, MaterializeOutcome::Materialized);
    assert_eq!(h.read("out/a.txt")?, b"payload");
    assert_eq!(traces.count("materialize artifact"), 1);

    // without the object a second write would fail, so success proves no content I/O
    h.drop_object(&identity)?;
    let second = materializer
        .request_materialize(path("out/a.txt"), identity, deps(&["src/a", "src/b"]))
        .await?;
    assert_eq!(second, MaterializeOutcome::DepsUpdated);
    assert_eq!(traces.count("materialize artifact"), 1);
    assert_eq!(traces.count("already materialized, updating deps only"), 1);
    let entry = h.state.get(&path("out/a.txt")).expect("entry tracked");
    assert_eq!(entry.deps, deps(&["src/a", "src/b"]));
    Ok(())
}

#[tokio::test]
async fn compare_policy_skips_identical_deps() -> Result<()> {
    let (traces, _guard) = capture_traces();
    let h = Harness::new()?;
    let materializer = h.deferred(DepsPolicy::Compare);
    let identity = h.file(b"payload")?;

    materializer
        .request_materialize(path("out/a"), identity.clone(), deps(&["src/a"]))
        .await?;
    let same = materializer
        .request_materialize(path("out/a"), identity.clone(), deps(&["src/a"]))
        .await?;
    assert_eq!(same, MaterializeOutcome::Skipped);
    assert_eq!(traces.count("already materialized, skipping"), 1);
    assert_eq!(traces.count("updating deps only"), 0);

    let changed = materializer
        .request_materialize(path("out/a"), identity, deps(&["src/b"]))
        .await?;
    assert_eq!(changed, MaterializeOutcome::DepsUpdated);
    assert_eq!(traces.count("already materialized, updating deps only"), 1);
    assert_eq!(materializer.counters().skipped, 1);
    Ok(())
}

#[tokio::test]
async fn changed_identity_rewrites_content() -> Result<()> {
    let (traces, _guard) = capture_traces();
    let h = Harness::new()?;
    let materializer = h.deferred(DepsPolicy::Record);

    materializer
        .request_materialize(path("out/a"), h.file(b"one")?, BTreeSet::new())
        .await?;
    let outcome = materializer
        .request_materialize(path("out/a"), h.file(b"two")?, BTreeSet::new())
        .await?;
    assert_eq!(outcome, MaterializeOutcome::Materialized);
    assert_eq!(h.read("out/a")?, b"two");
    assert_eq!(traces.count("materialize artifact"), 2);
    Ok(())
}

#[tokio::test]
async fn foreign_and_missing_content_is_replaced() -> Result<()> {
    let h = Harness::new()?;
    let materializer = h.deferred(DepsPolicy::Record);
    let identity = h.file(b"expected")?;

    fs::create_dir_all(h.root.join("out"))?;
    fs::write(h.root.join("out/a"), b"foreign")?;
    materializer
        .request_materialize(path("out/a"), identity.clone(), BTreeSet::new())
        .await?;
    assert_eq!(h.read("out/a")?, b"expected");

    fs::remove_file(h.root.join("out/a"))?;
    let outcome = materializer
        .request_materialize(path("out/a"), identity, BTreeSet::new())
        .await?;
    assert_eq!(outcome, MaterializeOutcome::Materialized);
    assert_eq!(h.read("out/a")?, b"expected");
    Ok(())
}

#[tokio::test]
async fn non_directory_ancestors_are_replaced() -> Result<()> {
    let h = Harness::new()?;
    let materializer = h.deferred(DepsPolicy::Record);
    fs::write(h.root.join("out"), b"i am a file")?;

    materializer
        .request_materialize(path("out/nested/a"), h.file(b"deep")?, BTreeSet::new())
        .await?;
    assert_eq!(h.read("out/nested/a")?, b"deep");
    Ok(())
}

#[tokio::test]
async fn missing_content_fails_only_that_request() -> Result<()> {
    let h = Harness::new()?;
    let materializer = h.deferred(DepsPolicy::Record);
    let absent = ArtifactIdentity::file(b"never stored", false);

    let err = materializer
        .request_materialize(path("out/broken"), absent, BTreeSet::new())
        .await
        .expect_err("content is missing");
    assert!(matches!(err, MaterializerError::MissingContent { .. }));
    assert_eq!(err.code(), "MZ822");
    assert_eq!(err.path(), &path("out/broken"));
    assert!(!materializer.has_artifact_at(&path("out/broken")));

    let ok = materializer
        .request_materialize(path("out/fine"), h.file(b"fine")?, BTreeSet::new())
        .await?;
    assert_eq!(ok, MaterializeOutcome::Materialized);
    Ok(())
}

#[tokio::test]
async fn concurrent_requests_for_one_path_write_once() -> Result<()> {
    let (traces, _guard) = capture_traces();
    let h = Harness::new()?;
    let materializer = h.deferred(DepsPolicy::Record);
    let identity = h.file(b"shared")?;

    let (first, second) = tokio::join!(
        materializer.request_materialize(path("out/shared"), identity.clone(), BTreeSet::new()),
        materializer.request_materialize(path("out/shared"), identity.clone(), BTreeSet::new()),
    );
    let mut outcomes = vec![first?, second?];
    outcomes.sort_by_key(|outcome| outcome.as_str());
    assert_eq!(
        outcomes,
        vec![MaterializeOutcome::DepsUpdated, MaterializeOutcome::Materialized]
    );
    assert_eq!(traces.count("materialize artifact"), 1);
    assert_eq!(materializer.counters().materialized, 1);
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn directories_keep_modes_and_symlinks() -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let h = Harness::new()?;
    let materializer = h.deferred(DepsPolicy::Record);
    let tool = ArtifactIdentity::file_with_digest(h.cas.put_bytes(b"#!/bin/sh\n")?, true);
    let tree = ArtifactIdentity::directory([
        ("tool".to_string(), tool),
        ("data.txt".to_string(), h.file(b"data")?),
        ("link".to_string(), ArtifactIdentity::symlink("data.txt")?),
    ])?;

    materializer
        .request_materialize(path("out/pkg"), tree, BTreeSet::new())
        .await?;
    let tool_mode = fs::metadata(h.root.join("out/pkg/tool"))?.permissions().mode();
    let data_mode = fs::metadata(h.root.join("out/pkg/data.txt"))?.permissions().mode();
    assert_eq!(tool_mode & 0o777, 0o755);
    assert_eq!(data_mode & 0o777, 0o644);
    assert_eq!(
        fs::read_link(h.root.join("out/pkg/link"))?,
        PathBuf::from("data.txt")
    );
    Ok(())
}

#[tokio::test]
async fn overlapping_entries_are_forgotten() -> Result<()> {
    let h = Harness::new()?;
    let materializer = h.deferred(DepsPolicy::Record);
    let tree = ArtifactIdentity::directory([("x".to_string(), h.file(b"x")?)])?;

    materializer
        .request_materialize(path("out/dir"), tree, BTreeSet::new())
        .await?;
    materializer
        .request_materialize(path("out/dir/x"), h.file(b"y")?, BTreeSet::new())
        .await?;
    assert!(!materializer.has_artifact_at(&path("out/dir")));
    assert!(materializer.has_artifact_at(&path("out/dir/x")));
    assert_eq!(h.read("out/dir/x")?, b"y");
    Ok(())
}

#[tokio::test]
async fn reserved_paths_are_rejected() -> Result<()> {
    let h = Harness::new()?;
    let materializer = h.deferred(DepsPolicy::Record);
    for raw in ["mz-out/cache/materializer_state/db.sqlite", "mz-out"] {
        let err = materializer
            .request_materialize(path(raw), h.file(b"x")?, BTreeSet::new())
            .await
            .expect_err("reserved");
        assert_eq!(err, MaterializerError::ReservedPath { path: path(raw) });
    }
    Ok(())
}

#[tokio::test]
async fn declared_sources_are_reused_and_invalidation_removes_content() -> Result<()> {
    let (traces, _guard) = capture_traces();
    let h = Harness::new()?;
    let materializer = h.deferred(DepsPolicy::Record);
    fs::create_dir_all(h.root.join("src"))?;
    fs::write(h.root.join("src/in.txt"), b"source")?;
    let identity = ArtifactIdentity::file(b"source", false);

    materializer
        .declare_existing(path("src/in.txt"), identity.clone(), BTreeSet::new())
        .await?;
    assert_eq!(
        materializer.get_materialized_path(&path("src/in.txt")),
        Some(h.root.join("src/in.txt"))
    );
    let outcome = materializer
        .request_materialize(path("src/in.txt"), identity, BTreeSet::new())
        .await?;
    assert_eq!(outcome, MaterializeOutcome::DepsUpdated);
    assert_eq!(traces.count("materialize artifact"), 0);

    assert!(materializer.invalidate(&path("src/in.txt")).await?);
    assert!(!h.root.join("src/in.txt").exists());
    assert!(materializer.get_materialized_path(&path("src/in.txt")).is_none());
    assert!(!materializer.invalidate(&path("src/in.txt")).await?);
    Ok(())
}

#[tokio::test]
async fn clean_stale_removes_idle_entries() -> Result<()> {
    let h = Harness::new()?;
    let materializer = h.deferred(DepsPolicy::Record);
    materializer
        .request_materialize(path("out/old"), h.file(b"old")?, BTreeSet::new())
        .await?;
    materializer
        .request_materialize(path("out/new"), h.file(b"new")?, BTreeSet::new())
        .await?;
    let now = crate::core::fs::timestamp_secs();
    h.state.touch(&path("out/old"), now - 1_000)?;

    let summary = materializer.clean_stale(100, now).await?;
    assert_eq!(summary.scanned, 2);
    assert_eq!(summary.removed, vec![path("out/old")]);
    assert_eq!(summary.retained, 1);
    assert!(!h.root.join("out/old").exists());
    assert!(h.root.join("out/new").exists());
    Ok(())
}

#[tokio::test]
async fn virtualized_projects_then_hydrates_on_read() -> Result<()> {
    let (traces, _guard) = capture_traces();
    let h = Harness::new()?;
    let service = Arc::new(LocalProjection::new(&h.root, h.cas.clone()));
    let materializer = Materializer::Virtualized(VirtualizedMaterializer::new(
        &h.root,
        service,
        Arc::clone(&h.state),
        vec![path("mz-out/cache")],
    ));
    let identity = h.file(b"lazy")?;

    let outcome = materializer
        .request_materialize(path("out/lazy"), identity.clone(), BTreeSet::new())
        .await?;
    assert_eq!(outcome, MaterializeOutcome::Materialized);
    assert!(!h.root.join("out/lazy").exists(), "content is not written up front");
    assert!(materializer.has_artifact_at(&path("out/lazy")));
    assert_eq!(traces.count("materialize artifact"), 0);

    let Materializer::Virtualized(inner) = &materializer else {
        unreachable!()
    };
    assert_eq!(inner.read(&path("out/lazy")).await?, b"lazy");
    assert_eq!(inner.projected(), 1);

    let again = materializer
        .request_materialize(path("out/lazy"), identity, BTreeSet::new())
        .await?;
    assert_eq!(again, MaterializeOutcome::Skipped);

    let missing = materializer
        .ensure_local(&path("out/unknown"))
        .await
        .expect_err("never projected");
    assert_eq!(missing.code(), "MZ824");

    assert!(materializer.invalidate(&path("out/lazy")).await?);
    assert!(!h.root.join("out/lazy").exists());
    Ok(())
}

#[tokio::test]
async fn recorded_projections_survive_a_new_service() -> Result<()> {
    let h = Harness::new()?;
    let identity = h.file(b"kept")?;
    let first = VirtualizedMaterializer::new(
        &h.root,
        Arc::new(LocalProjection::new(&h.root, h.cas.clone())),
        Arc::clone(&h.state),
        Vec::new(),
    );
    first
        .request_materialize(path("out/kept"), identity.clone(), deps(&["src/kept"]))
        .await?;
    assert!(h.state.contains(&path("out/kept")));

    let second = VirtualizedMaterializer::new(
        &h.root,
        Arc::new(LocalProjection::new(&h.root, h.cas.clone())),
        Arc::clone(&h.state),
        Vec::new(),
    );
    assert_eq!(second.restore_projections(), 1);
    let outcome = second
        .request_materialize(path("out/kept"), identity, deps(&["src/kept"]))
        .await?;
    assert_eq!(outcome, MaterializeOutcome::Skipped);
    assert_eq!(second.read(&path("out/kept")).await?, b"kept");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nested_requests_in_flight_keep_state_in_step_with_disk() -> Result<()> {
    let h = Harness::new()?;
    let materializer = Arc::new(h.deferred(DepsPolicy::Record));

    for round in 0..40 {
        let dir = path(&format!("out/r{round}/d"));
        let file = path(&format!("out/r{round}/d/f0"));
        let tree = ArtifactIdentity::directory(
            (0..20)
                .map(|n| -> Result<(String, ArtifactIdentity)> {
                    Ok((format!("f{n}"), h.file(format!("dir {n}").as_bytes())?))
                })
                .collect::<Result<Vec<_>>>()?,
        )?;
        let single = h.file(format!("file {round}").as_bytes())?;

        let dir_task = {
            let materializer = Arc::clone(&materializer);
            let dir = dir.clone();
            tokio::spawn(async move {
                materializer
                    .request_materialize(dir, tree, BTreeSet::new())
                    .await
            })
        };
        let file_task = {
            let materializer = Arc::clone(&materializer);
            let file = file.clone();
            tokio::spawn(async move {
                materializer
                    .request_materialize(file, single, BTreeSet::new())
                    .await
            })
        };
        dir_task.await??;
        file_task.await??;

        assert!(
            !(h.state.contains(&dir) && h.state.contains(&file)),
            "round {round}: nested paths tracked together"
        );
        for tracked in [&dir, &file] {
            if let Some(entry) = h.state.get(tracked) {
                let on_disk = h.cas.ingest_path(&h.root.join(tracked.as_str()))?;
                assert_eq!(on_disk, entry.identity, "round {round}: {tracked} disagrees with disk");
            }
        }
    }
    Ok(())
}
