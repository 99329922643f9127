use std::fs;
use std::path::Path;

use anyhow::Result;
use mz_domain::{ArtifactIdentity, ArtifactPath};

use super::layout::{COMMAND_HASHES_DIR, STATE_DIR};
use super::*;

fn path(raw: &str) -> ArtifactPath {
    ArtifactPath::new(raw).expect("valid artifact path")
}

fn config(root: &Path) -> MaterializerConfig {
    MaterializerConfig::with_defaults(root)
}

fn stored(service: &MaterializerService, bytes: &[u8]) -> Result<ArtifactIdentity> {
    service.content_store().put_bytes(bytes)?;
    Ok(ArtifactIdentity::file(bytes, false))
}

#[tokio::test]
async fn entries_survive_restart() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let cfg = config(temp.path());

    let service = MaterializerService::on_startup(cfg.clone())?;
    assert_eq!(service.disposition(), &StateDisposition::Created);
    let identity = stored(&service, b"payload")?;
    let outcome = service
        .request_materialize(MaterializeRequest::new(path("out/a"), identity.clone()))
        .await?;
    assert_eq!(outcome, MaterializeOutcome::Materialized);
    service.on_shutdown()?;

    let service = MaterializerService::on_startup(cfg)?;
    assert_eq!(
        service.disposition(),
        &StateDisposition::Reused {
            loaded: 1,
            skipped: 0
        }
    );
    assert!(service.has_artifact_at(&path("out/a")));
    let outcome = service
        .request_materialize(
            MaterializeRequest::new(path("out/a"), identity).with_deps([path("src/a.c")]),
        )
        .await?;
    assert_eq!(outcome, MaterializeOutcome::DepsUpdated);
    assert_eq!(
        service.state().get(&path("out/a")).map(|entry| entry.deps.len()),
        Some(1)
    );
    service.on_shutdown()?;
    Ok(())
}

#[tokio::test]
async fn version_bump_resets_state() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let mut cfg = config(temp.path());

    let service = MaterializerService::on_startup(cfg.clone())?;
    let identity = stored(&service, b"payload")?;
    service
        .request_materialize(MaterializeRequest::new(path("out/a"), identity.clone()))
        .await?;
    service.on_shutdown()?;

    cfg.sqlite_materializer_state_version = 1;
    let service = MaterializerService::on_startup(cfg)?;
    assert!(matches!(service.disposition(), StateDisposition::Reset { .. }));
    assert!(service.state().is_empty());
    let outcome = service
        .request_materialize(MaterializeRequest::new(path("out/a"), identity))
        .await?;
    assert_eq!(outcome, MaterializeOutcome::Materialized);
    service.on_shutdown()?;
    Ok(())
}

#[test]
fn unreadable_state_is_reset() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let cfg = config(temp.path());
    let layout = CacheDirectoryLayout::new(temp.path());
    fs::create_dir_all(layout.state_dir())?;
    fs::write(layout.state_db(), vec![b'x'; 4096])?;

    let service = MaterializerService::on_startup(cfg.clone())?;
    assert!(matches!(service.disposition(), StateDisposition::Reset { .. }));
    service.on_shutdown()?;

    let service = MaterializerService::on_startup(cfg)?;
    assert!(matches!(
        service.disposition(),
        StateDisposition::Reused { loaded: 0, .. }
    ));
    service.on_shutdown()?;
    Ok(())
}

#[test]
fn disabling_features_removes_their_directories() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let mut cfg = config(temp.path());
    cfg.hash_all_commands = true;

    let service = MaterializerService::on_startup(cfg.clone())?;
    assert_eq!(
        service.layout().cache_listing()?,
        vec![COMMAND_HASHES_DIR, STATE_DIR]
    );
    service.on_shutdown()?;

    cfg.sqlite_materializer_state = false;
    let service = MaterializerService::on_startup(cfg.clone())?;
    assert_eq!(service.layout().cache_listing()?, vec![COMMAND_HASHES_DIR]);
    assert_eq!(service.disposition(), &StateDisposition::InMemory);
    assert!(!service.state().is_durable());
    service.on_shutdown()?;

    cfg.hash_all_commands = false;
    let service = MaterializerService::on_startup(cfg)?;
    assert!(service.layout().cache_listing()?.is_empty());
    service.on_shutdown()?;
    Ok(())
}

#[tokio::test]
async fn in_memory_state_forgets_across_restart() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let mut cfg = config(temp.path());
    cfg.sqlite_materializer_state = false;

    let service = MaterializerService::on_startup(cfg.clone())?;
    let identity = stored(&service, b"payload")?;
    service
        .request_materialize(MaterializeRequest::new(path("out/a"), identity.clone()))
        .await?;
    service.on_shutdown()?;

    let service = MaterializerService::on_startup(cfg)?;
    assert!(!service.has_artifact_at(&path("out/a")));
    let outcome = service
        .request_materialize(MaterializeRequest::new(path("out/a"), identity))
        .await?;
    assert_eq!(outcome, MaterializeOutcome::Materialized);
    service.on_shutdown()?;
    Ok(())
}

#[test]
fn second_daemon_is_refused() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let cfg = config(temp.path());

    let first = MaterializerService::on_startup(cfg.clone())?;
    let err = MaterializerService::on_startup(cfg.clone()).expect_err("lock is held");
    assert_eq!(err.code(), diagnostics::startup::DAEMON_LOCKED);
    first.on_shutdown()?;

    let again = MaterializerService::on_startup(cfg)?;
    again.on_shutdown()?;
    Ok(())
}

#[test]
fn reconfigure_never_swaps_live_settings() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let cfg = config(temp.path());
    let service = MaterializerService::on_startup(cfg.clone())?;

    assert_eq!(service.reconfigure(&cfg), ConfigChange::Unchanged);

    let mut next = cfg.clone();
    next.sqlite_materializer_state_version = 7;
    next.deps_policy = DepsPolicy::Compare;
    assert_eq!(
        service.reconfigure(&next),
        ConfigChange::RestartRequired(vec!["sqlite_materializer_state_version", "deps_policy"])
    );
    assert_eq!(service.config(), &cfg);
    service.on_shutdown()?;
    Ok(())
}

#[tokio::test]
async fn commands_are_recorded_when_hashing() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let mut cfg = config(temp.path());
    cfg.hash_all_commands = true;
    let service = MaterializerService::on_startup(cfg)?;
    let identity = stored(&service, b"obj")?;
    let argv = vec!["cc".to_string(), "-c".to_string(), "a.c".to_string()];

    service
        .request_materialize(
            MaterializeRequest::new(path("out/a.o"), identity).with_command(argv.clone()),
        )
        .await?;

    let hash = CommandHashStore::hash_command(&argv);
    let record = service
        .command_hashes()
        .expect("command hashing enabled")
        .lookup(&hash)?
        .expect("command recorded");
    assert_eq!(record.argv, argv);
    assert_eq!(record.path, path("out/a.o"));
    service.on_shutdown()?;
    Ok(())
}

#[tokio::test]
async fn cache_directories_are_reserved() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let service = MaterializerService::on_startup(config(temp.path()))?;
    let identity = stored(&service, b"x")?;

    let err = service
        .request_materialize(MaterializeRequest::new(
            path("mz-out/cache/materializer_state/db.sqlite"),
            identity,
        ))
        .await
        .expect_err("reserved");
    assert_eq!(err.code(), diagnostics::materialize::RESERVED_PATH);
    service.on_shutdown()?;
    Ok(())
}

#[tokio::test]
async fn refused_state_write_fails_the_request_without_an_entry() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let cfg = config(temp.path());
    let service = MaterializerService::on_startup(cfg)?;
    let identity = stored(&service, b"payload")?;

    let conn = rusqlite::Connection::open(service.layout().state_db())?;
    conn.execute_batch(
        "CREATE TRIGGER refuse_rows BEFORE INSERT ON materializer_state \
         BEGIN SELECT RAISE(ABORT, 'disk is full'); END;",
    )?;

    let err = service
        .request_materialize(MaterializeRequest::new(path("out/a"), identity))
        .await
        .expect_err("insert is refused");
    assert_eq!(err.code(), diagnostics::materialize::STATE_FAILURE);
    assert_eq!(err.path(), &path("out/a"));
    assert!(!service.has_artifact_at(&path("out/a")));
    assert!(service.state().is_empty());
    let rows: i64 = conn.query_row(
        "SELECT COUNT(*) FROM materializer_state WHERE path = 'out/a'",
        [],
        |row| row.get(0),
    )?;
    assert_eq!(rows, 0);
    service.on_shutdown()?;
    Ok(())
}

#[tokio::test]
async fn status_reports_state() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let service = MaterializerService::on_startup(config(temp.path()))?;
    let identity = stored(&service, b"payload")?;
    service
        .request_materialize(MaterializeRequest::new(path("out/a"), identity))
        .await?;

    let status = service.status()?;
    assert!(status.durable);
    assert_eq!(status.entries, 1);
    assert_eq!(status.counters.materialized, 1);
    assert_eq!(status.cache_dirs, vec![STATE_DIR]);
    assert!(status.cache_bytes > 0);

    let json = serde_json::to_value(&status)?;
    assert_eq!(json["materializations"], "deferred");
    assert_eq!(json["state"]["kind"], "created");
    service.on_shutdown()?;
    Ok(())
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn switching_strategy_resets_state() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let mut cfg = config(temp.path());

    let service = MaterializerService::on_startup(cfg.clone())?;
    let identity = stored(&service, b"payload")?;
    service
        .request_materialize(MaterializeRequest::new(path("out/a"), identity.clone()))
        .await?;
    service.on_shutdown()?;

    cfg.materializations = MaterializationMethod::Eden;
    let service = MaterializerService::on_startup(cfg.clone())?;
    assert_eq!(service.materializer().method(), MaterializationMethod::Eden);
    assert!(matches!(service.disposition(), StateDisposition::Reset { .. }));
    let outcome = service
        .request_materialize(MaterializeRequest::new(path("out/a"), identity.clone()))
        .await?;
    assert_eq!(outcome, MaterializeOutcome::Materialized);
    let local = service.ensure_local(&path("out/a")).await?;
    assert_eq!(fs::read(local)?, b"payload");
    service.on_shutdown()?;

    cfg.materializations = MaterializationMethod::Deferred;
    let service = MaterializerService::on_startup(cfg)?;
    assert!(matches!(service.disposition(), StateDisposition::Reset { .. }));
    let outcome = service
        .request_materialize(MaterializeRequest::new(path("out/a"), identity))
        .await?;
    assert_eq!(outcome, MaterializeOutcome::Materialized);
    service.on_shutdown()?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
#[test]
fn virtualized_strategy_is_fatal_off_linux() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let mut cfg = config(temp.path());
    cfg.materializations = MaterializationMethod::Eden;
    let err = MaterializerService::on_startup(cfg).expect_err("unsupported");
    assert_eq!(err.code(), diagnostics::startup::UNSUPPORTED_STRATEGY);
    Ok(())
}
