use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Materialize build artifacts from the content store",
    disable_help_subcommand = true
)]
#[allow(clippy::struct_excessive_bools)]
pub struct MzCli {
    #[arg(
        long,
        env = "MZ_ROOT",
        value_name = "DIR",
        help = "Build root (defaults to the current directory)",
        global = true
    )]
    pub root: Option<PathBuf>,
    #[arg(
        short,
        long,
        help = "Suppress human output (errors still print to stderr)",
        global = true
    )]
    pub quiet: bool,
    #[arg(short, long, action = ArgAction::Count, help = "Increase logging (-vv reaches trace)", global = true)]
    pub verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v/-q", global = true)]
    pub trace: bool,
    #[arg(long, help = "Emit {status,message,details} JSON envelopes", global = true)]
    pub json: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the materializer and print its effective configuration.
    AuditConfig,
    /// Store a file or directory tree and print its identity.
    Ingest(IngestArgs),
    /// Serve a batch of materialization requests concurrently.
    Materialize(MaterializeArgs),
    /// Report the materializer's state.
    Status,
    /// Remove artifacts that have not been accessed recently.
    CleanStale(CleanStaleArgs),
    /// Forget artifacts and delete their on-disk content.
    Invalidate(InvalidateArgs),
}

#[derive(Args, Debug)]
pub struct IngestArgs {
    #[arg(value_name = "PATH")]
    pub path: PathBuf,
}

#[derive(Args, Debug)]
pub struct MaterializeArgs {
    /// JSON array of `{path, source | identity, deps, command}` requests.
    #[arg(value_name = "REQUESTS")]
    pub requests: PathBuf,
    #[arg(long, help = "Hydrate virtualized artifacts before exiting")]
    pub hydrate: bool,
}

#[derive(Args, Debug)]
pub struct CleanStaleArgs {
    #[arg(long, value_name = "SECS", help = "Idle time before an artifact is removed")]
    pub ttl_secs: Option<u64>,
}

#[derive(Args, Debug)]
pub struct InvalidateArgs {
    #[arg(value_name = "PATH", required = true)]
    pub paths: Vec<String>,
}
