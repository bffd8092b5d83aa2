//! Keystone: bootstrap a network of interdependent artifacts.
//!
//! A bootstrap plan names a fixed set of libraries, data stores and modules
//! plus one hub, the on-backend directory every other artifact is registered
//! in. Keystone deploys them in dependency order, substituting library
//! addresses into bytecode before each deployment, wires artifacts to each
//! other, registers names in the hub, publishes the hub address to an
//! external name service and checks that what landed is consistent.
//!
//! # Architecture
//!
//! - [`core::resolver`]: one task and two promises (`address`, `settled`)
//!   per artifact; dependents await them instead of following a sort.
//! - [`core::linker`], [`core::deployer`]: placeholder substitution and
//!   submission.
//! - [`core::registry`], [`core::namereg`], [`core::verify`]: hub client,
//!   name-service bridge and post-condition checks.
//! - [`core::orchestrator`]: the `run` entry point.
//! - [`core::journal`]: SQLite record of what each run landed.
//!
//! Backends plug in through [`core::backend::Backend`] and
//! [`core::backend::NameService`]; payloads go through a
//! [`core::codec::Codec`]. [`core::sim::SimChain`] implements both traits in
//! process.
//!
//! # Examples
//!
//! ```bash
//! keystone validate network.toml
//! keystone simulate network.toml --format json
//! keystone placeholder ErrorsLib --legacy
//! keystone journal landed
//! ```

pub mod core;
mod cli;

use crate::cli::{Cli, Command, JournalCommand, LinkCli, PlaceholderCli, SimulateCli, ValidateCli};
use crate::core::address::Address;
use crate::core::artifact::{ArtifactId, Template};
use crate::core::config::{BootstrapConfig, load_config};
use crate::core::error::KeystoneError;
use crate::core::journal::Journal;
use crate::core::linker::{self, Linker};
use crate::core::orchestrator::Orchestrator;
use crate::core::plan::BootstrapPlan;
use crate::core::sim::SimChain;
use crate::core::time::command_envelope;
use clap::Parser;
use colored::Colorize;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the tracing subscriber. `RUST_LOG` overrides the default filter.
///
/// Logs go to stderr so `--format json` output stays machine-readable.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,keystone=info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

pub async fn run() -> Result<(), KeystoneError> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Validate(args) => run_validate(args),
        Command::Simulate(args) => run_simulate(args, config).await,
        Command::Placeholder(args) => run_placeholder(args),
        Command::Link(args) => run_link(args),
        Command::Journal(args) => {
            let path = args.path.unwrap_or_else(|| config.journal.path.clone());
            if !path.exists() {
                return Err(KeystoneError::NotFound(format!(
                    "journal {}",
                    path.display()
                )));
            }
            let journal = Journal::open(&path)?;
            match args.command {
                JournalCommand::Runs => print_runs(&journal, &args.format),
                JournalCommand::Landed { run } => print_landed(&journal, run, &args.format),
            }
        }
    }
}

fn run_validate(args: ValidateCli) -> Result<(), KeystoneError> {
    let plan = BootstrapPlan::load(&args.plan)?;
    let graph = plan.validate()?;

    if args.format == "json" {
        let envelope = command_envelope(
            "validate",
            "ok",
            serde_json::json!({
                "plan": args.plan.display().to_string(),
                "hub": plan.hub.id,
                "artifacts": plan.artifacts.len() + 1,
                "waves": graph.waves,
            }),
        );
        println!("{}", serde_json::to_string_pretty(&envelope).unwrap_or_default());
        return Ok(());
    }

    println!(
        "{} {} is valid: {} artifacts in {} waves",
        "✓".bright_green(),
        args.plan.display(),
        plan.artifacts.len() + 1,
        graph.waves.len()
    );
    for (i, wave) in graph.waves.iter().enumerate() {
        let ids: Vec<&str> = wave.iter().map(|id| id.as_str()).collect();
        println!("  {} {}", format!("wave {}:", i).bright_cyan(), ids.join(", "));
    }
    Ok(())
}

async fn run_simulate(args: SimulateCli, config: BootstrapConfig) -> Result<(), KeystoneError> {
    let plan = BootstrapPlan::load(&args.plan)?;
    let sim = Arc::new(SimChain::new());

    let mut orchestrator = Orchestrator::new(sim.connection(), config.clone())
        .with_drain(Duration::from_millis(args.drain_ms));
    let journal_path: Option<PathBuf> = if args.no_journal {
        None
    } else {
        Some(args.journal.unwrap_or_else(|| config.journal.path.clone()))
    };
    if let Some(path) = &journal_path {
        orchestrator = orchestrator.with_journal(Arc::new(Journal::open(path)?));
    }

    let outcome = orchestrator.run(&plan).await;

    if args.format == "json" {
        let envelope = match &outcome {
            Ok(result) => command_envelope(
                "simulate",
                "ok",
                serde_json::to_value(result).map_err(|e| KeystoneError::Codec(e.to_string()))?,
            ),
            Err(e) => command_envelope(
                "simulate",
                "error",
                serde_json::json!({
                    "artifact": e.artifact,
                    "phase": e.phase.as_str(),
                    "error": e.source.to_string(),
                }),
            ),
        };
        println!("{}", serde_json::to_string_pretty(&envelope).unwrap_or_default());
        return outcome.map(|_| ()).map_err(KeystoneError::from);
    }

    let result = outcome?;
    println!(
        "{} bootstrap {} complete: {} artifacts deployed",
        "✓".bright_green(),
        result.run_id,
        result.deployed.len()
    );
    println!("  {} {}", "hub".bright_cyan(), result.hub);
    for (id, address) in &result.deployed {
        println!("  {:<24} {}", id.as_str(), address);
    }
    if !result.entries.is_empty() {
        println!("{}", "registered:".bright_cyan());
        for (name, address) in &result.entries {
            println!("  {:<24} {}", name, address);
        }
    }
    if let Some(name) = &result.published_as {
        println!("{} hub published as '{}'", "▸".bright_cyan(), name);
    }
    if let Some(path) = journal_path {
        println!("{} journal: {}", "▸".bright_cyan(), path.display());
    }
    Ok(())
}

fn run_placeholder(args: PlaceholderCli) -> Result<(), KeystoneError> {
    for id in &args.ids {
        let id = ArtifactId::new(id.as_str());
        let text = if args.legacy {
            linker::legacy_placeholder(&id)
        } else {
            linker::placeholder(&id)
        };
        println!("{}\t{}", id, text);
    }
    Ok(())
}

fn run_link(args: LinkCli) -> Result<(), KeystoneError> {
    let template = Template::new(fs::read_to_string(&args.template)?);
    let mut resolved = BTreeMap::new();
    for pair in &args.addresses {
        let (id, address) = pair.split_once('=').ok_or_else(|| {
            KeystoneError::InvalidAddress(format!("expected ID=ADDRESS, got '{}'", pair))
        })?;
        resolved.insert(ArtifactId::new(id), Address::from_str(address)?);
    }
    let code = Linker::new().link(&template, &resolved)?;
    println!("{}", hex::encode(code));
    Ok(())
}

fn print_runs(journal: &Journal, format: &str) -> Result<(), KeystoneError> {
    let runs = journal.runs()?;
    if format == "json" {
        let envelope = command_envelope("journal.runs", "ok", serde_json::json!({ "runs": runs }));
        println!("{}", serde_json::to_string_pretty(&envelope).unwrap_or_default());
        return Ok(());
    }
    if runs.is_empty() {
        println!("no runs recorded");
    }
    for run in runs {
        let status = match run.status.as_str() {
            "succeeded" => run.status.as_str().bright_green(),
            "failed" => run.status.as_str().bright_red(),
            other => other.bright_yellow(),
        };
        println!("{}  {:<10} hub={}  started={}", run.run_id, status, run.hub, run.started_at);
        if let Some(error) = run.error {
            println!("    {}", error.red());
        }
    }
    Ok(())
}

fn print_landed(journal: &Journal, run: Option<String>, format: &str) -> Result<(), KeystoneError> {
    let run_id = match run {
        Some(id) => id,
        None => journal
            .latest_run_id()?
            .ok_or_else(|| KeystoneError::NotFound("any recorded run".to_string()))?,
    };
    let landed = journal.landed(&run_id)?;
    let registrations = journal.registrations(&run_id)?;

    if format == "json" {
        let envelope = command_envelope(
            "journal.landed",
            "ok",
            serde_json::json!({
                "run_id": run_id,
                "landed": landed,
                "registrations": registrations,
            }),
        );
        println!("{}", serde_json::to_string_pretty(&envelope).unwrap_or_default());
        return Ok(());
    }

    println!("run {}", run_id.bright_cyan());
    for record in &landed {
        println!(
            "  {:<24} {:<10} {}  last step: {}",
            record.artifact.as_str(),
            record.kind,
            record.address,
            record.phase
        );
    }
    for reg in &registrations {
        println!("  {} {} -> {}", "hub".bright_cyan(), reg.name, reg.address);
    }
    Ok(())
}
