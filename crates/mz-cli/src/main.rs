use std::collections::BTreeSet;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use mz_core::{
    diagnostics, ArtifactIdentity, ArtifactPath, MaterializeRequest, MaterializerService,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{CleanStaleArgs, Command, IngestArgs, InvalidateArgs, MaterializeArgs, MzCli};

/// Result of one invocation, rendered as text or as a JSON envelope.
struct Outcome {
    message: String,
    details: Value,
    failed: bool,
}

impl Outcome {
    fn ok(message: impl Into<String>, details: Value) -> Self {
        Self {
            message: message.into(),
            details,
            failed: false,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = MzCli::parse();
    init_tracing(cli.trace, cli.verbose);

    match run(&cli).await {
        Ok(outcome) => {
            emit_output(&cli, &outcome)?;
            if outcome.failed {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(err) if cli.json => {
            let payload = json!({
                "status": "error",
                "code": diagnostics::code_of(&err),
                "message": format!("{err:#}"),
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
            std::process::exit(2);
        }
        Err(err) => Err(eyre!("{err:?}")),
    }
}

fn init_tracing(trace: bool, verbose: u8) {
    let level = if trace {
        "trace"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = EnvFilter::try_from_env("MZ_LOG")
        .unwrap_or_else(|_| EnvFilter::new(format!("mz={level},mz_core={level}")));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .with_level(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn emit_output(cli: &MzCli, outcome: &Outcome) -> Result<()> {
    if cli.json {
        let payload = json!({
            "status": if outcome.failed { "failed" } else { "ok" },
            "message": outcome.message,
            "details": outcome.details,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else if !cli.quiet && !outcome.message.is_empty() {
        println!("{}", outcome.message);
    }
    Ok(())
}

async fn run(cli: &MzCli) -> anyhow::Result<Outcome> {
    let root = match &cli.root {
        Some(root) => root.clone(),
        None => std::env::current_dir().context("failed to resolve the current directory")?,
    };
    let service = MaterializerService::start(&root)?;

    let outcome = match &cli.command {
        Command::AuditConfig => audit_config(&service),
        Command::Ingest(args) => ingest(&service, args),
        Command::Materialize(args) => return materialize(service, args).await,
        Command::Status => status(&service),
        Command::CleanStale(args) => clean_stale(&service, args).await,
        Command::Invalidate(args) => invalidate(&service, args).await,
    };
    service.on_shutdown()?;
    outcome
}

fn audit_config(service: &MaterializerService) -> anyhow::Result<Outcome> {
    let details = serde_json::to_value(service.config())?;
    let mut lines = vec!["[materializer]".to_string()];
    if let Some(map) = details.as_object() {
        for (key, value) in map {
            if key == "build_root" {
                continue;
            }
            lines.push(format!("{key} = {value}"));
        }
    }
    Ok(Outcome::ok(lines.join("\n"), details))
}

fn ingest(service: &MaterializerService, args: &IngestArgs) -> anyhow::Result<Outcome> {
    let source = resolve(service.config().build_root(), &args.path);
    let identity = service.content_store().ingest_path(&source)?;
    let details = serde_json::to_value(&identity)?;
    Ok(Outcome::ok(serde_json::to_string_pretty(&details)?, details))
}

/// One entry of a `mz materialize` request file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RequestEntry {
    path: String,
    #[serde(default)]
    source: Option<PathBuf>,
    #[serde(default)]
    identity: Option<ArtifactIdentity>,
    #[serde(default)]
    deps: Vec<String>,
    #[serde(default)]
    command: Option<Vec<String>>,
}

fn load_requests(
    service: &MaterializerService,
    file: &Path,
) -> anyhow::Result<Vec<MaterializeRequest>> {
    let raw =
        fs::read_to_string(file).with_context(|| format!("failed to read {}", file.display()))?;
    let entries: Vec<RequestEntry> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", file.display()))?;
    let root = service.config().build_root();
    entries
        .into_iter()
        .map(|entry| -> anyhow::Result<MaterializeRequest> {
            let path = ArtifactPath::new(&entry.path)?;
            let identity = match (entry.source, entry.identity) {
                (Some(source), None) => service
                    .content_store()
                    .ingest_path(&resolve(root, &source))
                    .with_context(|| format!("failed to ingest the source of {path}"))?,
                (None, Some(identity)) => identity,
                _ => bail!("request for {path} needs exactly one of `source` or `identity`"),
            };
            let deps = entry
                .deps
                .iter()
                .map(ArtifactPath::new)
                .collect::<Result<BTreeSet<_>, _>>()?;
            Ok(MaterializeRequest {
                path,
                identity,
                deps,
                command: entry.command,
            })
        })
        .collect()
}

async fn materialize(
    service: MaterializerService,
    args: &MaterializeArgs,
) -> anyhow::Result<Outcome> {
    let requests = match load_requests(&service, &args.requests) {
        Ok(requests) => requests,
        Err(err) => {
            service.on_shutdown()?;
            return Err(err);
        }
    };

    let service = Arc::new(service);
    let mut tasks = JoinSet::new();
    for request in requests {
        let service = Arc::clone(&service);
        tasks.spawn(async move {
            let path = request.path.clone();
            (path, service.request_materialize(request).await)
        });
    }
    // drain every task so the service is unshared again before shutdown
    let mut results = Vec::new();
    let mut lost = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(err) => lost.push(err.to_string()),
        }
    }
    results.sort_by(|(a, _), (b, _)| a.cmp(b));

    let mut lines = Vec::new();
    let mut details = Vec::new();
    let mut failed = !lost.is_empty();
    for (path, result) in results {
        let result = match result {
            Ok(outcome) if args.hydrate => service.ensure_local(&path).await.map(|_| outcome),
            other => other,
        };
        match result {
            Ok(outcome) => {
                lines.push(format!("{} {path}", outcome.as_str()));
                details.push(json!({ "path": path, "outcome": outcome }));
            }
            Err(err) => {
                failed = true;
                lines.push(format!("failed {path}: {err}"));
                details.push(json!({
                    "path": path,
                    "outcome": "failed",
                    "code": err.code(),
                    "error": err.to_string(),
                }));
            }
        }
    }
    for reason in lost {
        lines.push(format!("failed: {reason}"));
        details.push(json!({ "outcome": "failed", "error": reason }));
    }

    let service = Arc::into_inner(service)
        .ok_or_else(|| anyhow!("materializer is still referenced by a request"))?;
    service.on_shutdown()?;
    Ok(Outcome {
        message: lines.join("\n"),
        details: Value::Array(details),
        failed,
    })
}

fn status(service: &MaterializerService) -> anyhow::Result<Outcome> {
    let status = service.status()?;
    let message = format!(
        "materializations: {}\ndurable: {}\nentries: {}\ncache: {} ({} bytes)",
        status.materializations.as_str(),
        status.durable,
        status.entries,
        if status.cache_dirs.is_empty() {
            "empty".to_string()
        } else {
            status.cache_dirs.join(", ")
        },
        status.cache_bytes,
    );
    Ok(Outcome::ok(message, serde_json::to_value(&status)?))
}

async fn clean_stale(
    service: &MaterializerService,
    args: &CleanStaleArgs,
) -> anyhow::Result<Outcome> {
    let summary = service.clean_stale(args.ttl_secs).await?;
    let mut lines: Vec<String> = summary
        .removed
        .iter()
        .map(|path| format!("removed {path}"))
        .collect();
    lines.push(format!(
        "scanned {} artifacts, removed {}, retained {}",
        summary.scanned,
        summary.removed.len(),
        summary.retained
    ));
    Ok(Outcome::ok(lines.join("\n"), serde_json::to_value(&summary)?))
}

async fn invalidate(
    service: &MaterializerService,
    args: &InvalidateArgs,
) -> anyhow::Result<Outcome> {
    let mut lines = Vec::new();
    let mut details = Vec::new();
    for raw in &args.paths {
        let path = ArtifactPath::new(raw)?;
        let tracked = service.invalidate(&path).await?;
        lines.push(if tracked {
            format!("invalidated {path}")
        } else {
            format!("not tracked {path}")
        });
        details.push(json!({ "path": path, "tracked": tracked }));
    }
    Ok(Outcome::ok(lines.join("\n"), Value::Array(details)))
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}
