//! syslogd: the system log daemon and its command-line client.
//!
//! # Usage
//!
//! ```text
//! syslogd [--root <dir>] start
//! syslogd [--root <dir>] stop
//! syslogd [--root <dir>] status [--json]
//! syslogd [--root <dir>] query [<query>...] [--start N] [--count N] [--reverse] [--backend file|memory|mini|disaster] [--format std|bsd|raw|msg|json|<template>]
//! syslogd [--root <dir>] watch [<query>...] [--start N] [--format ...]
//! syslogd [--root <dir>] submit <message> [--sender S] [--level N] [--facility F] [--key K=V ...]
//! syslogd [--root <dir>] control <line>...
//! syslogd [--root <dir>] console
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use commands::{
    console::ConsoleArgs,
    daemon::StatusArgs,
    query::{QueryArgs, WatchArgs},
    submit::{ControlArgs, SubmitArgs},
};
use syslogd_core::DaemonConfig;

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "syslogd",
    version,
    about = "System log daemon: collect, route, store and query log records",
    long_about = None,
)]
struct Cli {
    /// Directory every daemon path is resolved under.
    #[arg(long, global = true, default_value = "/")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon in the foreground.
    Start,

    /// Ask a running daemon to shut down.
    Stop,

    /// Show daemon counters, parameters and store statistics.
    Status(StatusArgs),

    /// Search stored records.
    Query(QueryArgs),

    /// Stream matching records as they are stored.
    Watch(WatchArgs),

    /// Hand a record to the daemon.
    Submit(SubmitArgs),

    /// Send a control line (`= name value`, `@ module ...`). Requires root.
    Control(ControlArgs),

    /// Attach to the interactive console.
    Console(ConsoleArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = DaemonConfig::load_default_at(&cli.root)
        .with_context(|| format!("failed to load settings under {}", cli.root.display()))?;

    match cli.command {
        Commands::Start => commands::daemon::start(config),
        Commands::Stop => commands::daemon::stop(&config),
        Commands::Status(args) => args.run(&config),
        Commands::Query(args) => args.run(&config),
        Commands::Watch(args) => args.run(&config),
        Commands::Submit(args) => args.run(&config),
        Commands::Control(args) => args.run(&config),
        Commands::Console(args) => args.run(&config),
    }
}
