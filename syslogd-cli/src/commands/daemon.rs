//! `syslogd start|stop|status`: daemon lifecycle.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::Value;
use tabled::{settings::Style, Table, Tabled};

use syslogd_core::DaemonConfig;
use syslogd_daemon::{request_status, request_stop, start_blocking, DaemonError};

pub fn start(config: DaemonConfig) -> Result<()> {
    start_blocking(config).context("daemon exited with error")
}

pub fn stop(config: &DaemonConfig) -> Result<()> {
    match request_stop(&config.rpc_socket()) {
        Ok(()) => println!("daemon stop requested"),
        Err(DaemonError::DaemonNotRunning { .. }) => println!("daemon is not running"),
        Err(err) => return Err(err).context("failed to stop daemon"),
    }
    Ok(())
}

/// Arguments for `syslogd status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit the raw status JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct CounterRow {
    #[tabled(rename = "counter")]
    name: String,
    #[tabled(rename = "value")]
    value: String,
}

#[derive(Tabled)]
struct StoreRow {
    #[tabled(rename = "store")]
    store: String,
    #[tabled(rename = "records")]
    records: String,
    #[tabled(rename = "max")]
    max: String,
    #[tabled(rename = "bytes")]
    bytes: String,
    #[tabled(rename = "ids")]
    ids: String,
}

#[derive(Tabled)]
struct ModuleRow {
    #[tabled(rename = "module")]
    name: String,
    #[tabled(rename = "enabled")]
    enabled: String,
    #[tabled(rename = "rules")]
    rules: String,
    #[tabled(rename = "claims")]
    claims: String,
}

#[derive(Tabled)]
struct DestinationRow {
    #[tabled(rename = "destination")]
    path: String,
    #[tabled(rename = "state")]
    state: String,
    #[tabled(rename = "size")]
    size: String,
    #[tabled(rename = "writes")]
    writes: String,
    #[tabled(rename = "failures")]
    failures: String,
}

impl StatusArgs {
    pub fn run(self, config: &DaemonConfig) -> Result<()> {
        let socket = config.rpc_socket();
        let status = match request_status(&socket) {
            Ok(status) => status,
            Err(DaemonError::DaemonNotRunning { .. }) => {
                if self.json {
                    let payload = serde_json::json!({
                        "running": false,
                        "socket": socket.display().to_string(),
                    });
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&payload)
                            .context("failed to render daemon status JSON")?
                    );
                } else {
                    println!(
                        "{} syslogd is not running ({})",
                        "■".bright_black().bold(),
                        socket.display()
                    );
                }
                return Ok(());
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        };

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&status)
                    .context("failed to render daemon status JSON")?
            );
            return Ok(());
        }
        print_status(&status);
        Ok(())
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::Null => "-".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn print_status(status: &Value) {
    println!(
        "{} syslogd v{} | pid {} | up {}s | queue {}/{} | {} sessions | {} watchers",
        "■".green().bold(),
        env!("CARGO_PKG_VERSION"),
        text(&status["pid"]),
        text(&status["uptime_secs"]),
        text(&status["queue_depth"]),
        text(&status["queue_capacity"]),
        text(&status["sessions"]),
        text(&status["active_watchers"]),
    );

    if let Some(counters) = status["counters"].as_object() {
        let rows: Vec<CounterRow> = counters
            .iter()
            .map(|(name, value)| CounterRow {
                name: name.replace('_', " "),
                value: text(value),
            })
            .chain(std::iter::once(CounterRow {
                name: "last id".to_string(),
                value: text(&status["last_id"]),
            }))
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
    }

    if let Some(stores) = status["stores"].as_array().filter(|s| !s.is_empty()) {
        let rows: Vec<StoreRow> = stores
            .iter()
            .map(|store| StoreRow {
                store: text(&store["Store"]),
                records: text(&store["Records"]),
                max: text(&store["MaxRecords"]),
                bytes: text(&store["Bytes"]),
                ids: format!("{}..{}", text(&store["FirstID"]), text(&store["LastID"])),
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
    }

    let engine = &status["engine"];
    if engine.is_null() {
        println!("{}", "work queue did not answer; engine state unavailable".yellow());
        return;
    }
    if let Some(modules) = engine["modules"].as_array() {
        let rows: Vec<ModuleRow> = modules
            .iter()
            .map(|module| ModuleRow {
                name: text(&module["name"]),
                enabled: if module["enabled"].as_bool() == Some(true) {
                    "yes".green().to_string()
                } else {
                    "no".red().to_string()
                },
                rules: format!(
                    "{} ({} disabled)",
                    text(&module["rules"]),
                    text(&module["disabled_rules"])
                ),
                claims: text(&module["claims"]),
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
    }
    if let Some(dests) = engine["destinations"].as_array().filter(|d| !d.is_empty()) {
        let rows: Vec<DestinationRow> = dests
            .iter()
            .map(|dest| DestinationRow {
                path: text(&dest["path"]),
                state: destination_state(dest),
                size: text(&dest["size"]),
                writes: text(&dest["writes"]),
                failures: text(&dest["failures"]),
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
    }
}

fn destination_state(dest: &Value) -> String {
    if dest["disabled"].as_bool() == Some(true) {
        "DISABLED".red().bold().to_string()
    } else if dest["open"].as_bool() == Some(true) {
        "OPEN".green().to_string()
    } else {
        "CLOSED".bright_black().to_string()
    }
}
