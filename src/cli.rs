//! CLI struct definitions for the keystone command-line interface.
//!
//! All clap-derived types live here. Dispatch lives in `lib.rs`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "keystone",
    version = env!("CARGO_PKG_VERSION"),
    about = "Bring up a network of interdependent artifacts: link, deploy, register in the hub, verify."
)]
pub(crate) struct Cli {
    /// Config file (defaults to ./keystone.toml when present).
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Check a plan and print its deployment waves.
    Validate(ValidateCli),
    /// Run a plan against the in-process simulated backend.
    Simulate(SimulateCli),
    /// Print the link placeholders for artifact ids.
    Placeholder(PlaceholderCli),
    /// Link a template against known addresses and print the hex image.
    Link(LinkCli),
    /// Inspect the run journal.
    Journal(JournalCli),
}

#[derive(clap::Args, Debug)]
pub(crate) struct ValidateCli {
    /// Plan manifest (TOML).
    pub plan: PathBuf,
    /// Output format: 'text' or 'json'.
    #[clap(long, default_value = "text")]
    pub format: String,
}

#[derive(clap::Args, Debug)]
pub(crate) struct SimulateCli {
    /// Plan manifest (TOML).
    pub plan: PathBuf,
    /// Journal database; overrides `[journal] path` from the config.
    #[clap(long)]
    pub journal: Option<PathBuf>,
    /// Do not record the run.
    #[clap(long, conflicts_with = "journal")]
    pub no_journal: bool,
    /// On failure, wait this long for artifacts already in flight to land
    /// before exiting. Anything still running after that is abandoned.
    #[clap(long, default_value_t = 5000)]
    pub drain_ms: u64,
    /// Output format: 'text' or 'json'.
    #[clap(long, default_value = "text")]
    pub format: String,
}

#[derive(clap::Args, Debug)]
pub(crate) struct PlaceholderCli {
    /// Artifact ids.
    #[clap(required = true)]
    pub ids: Vec<String>,
    /// Print the legacy name-based form instead of the hashed one.
    #[clap(long)]
    pub legacy: bool,
}

#[derive(clap::Args, Debug)]
pub(crate) struct LinkCli {
    /// File holding the hex template.
    pub template: PathBuf,
    /// Resolved dependency as ID=ADDRESS; repeatable.
    #[clap(long = "address", short = 'a')]
    pub addresses: Vec<String>,
}

#[derive(clap::Args, Debug)]
pub(crate) struct JournalCli {
    /// Journal database; overrides `[journal] path` from the config.
    #[clap(long, global = true)]
    pub path: Option<PathBuf>,
    /// Output format: 'text' or 'json'.
    #[clap(long, default_value = "text", global = true)]
    pub format: String,
    #[clap(subcommand)]
    pub command: JournalCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum JournalCommand {
    /// List recorded runs, newest first.
    Runs,
    /// Show what a run landed (latest run by default).
    Landed {
        #[clap(long)]
        run: Option<String>,
    },
}
