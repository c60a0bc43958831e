//! `syslogd console`: attach the terminal to the daemon's console socket.

use std::io::{self, BufRead, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::thread;

use anyhow::{Context, Result};
use clap::Args;

use syslogd_core::DaemonConfig;

#[derive(Args, Debug)]
pub struct ConsoleArgs {
    /// Run these commands and exit instead of reading stdin.
    #[arg(short = 'c', long = "command")]
    pub commands: Vec<String>,
}

impl ConsoleArgs {
    pub fn run(self, config: &DaemonConfig) -> Result<()> {
        let socket = config.console_socket();
        let stream = UnixStream::connect(&socket)
            .with_context(|| format!("cannot reach the console at {}", socket.display()))?;
        let mut reader = stream.try_clone().context("failed to clone console socket")?;

        let printer = thread::spawn(move || -> io::Result<()> {
            let mut stdout = io::stdout();
            let mut buf = [0u8; 4096];
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    return Ok(());
                }
                stdout.write_all(&buf[..n])?;
                stdout.flush()?;
            }
        });

        let mut writer = stream;
        if self.commands.is_empty() {
            for line in io::stdin().lock().lines() {
                let line = line.context("failed to read stdin")?;
                if send(&mut writer, &line).is_err() {
                    break;
                }
            }
        } else {
            for line in self.commands.iter().map(String::as_str).chain(["quit"]) {
                send(&mut writer, line).context("console closed the connection")?;
            }
        }
        // The daemon hangs up after `quit`; otherwise tell it we are done.
        let _ = writer.shutdown(Shutdown::Write);

        match printer.join() {
            Ok(result) => result.context("failed to read from console"),
            Err(_) => anyhow::bail!("console reader thread panicked"),
        }
    }
}

fn send(stream: &mut UnixStream, line: &str) -> io::Result<()> {
    stream.write_all(line.as_bytes())?;
    stream.write_all(b"\n")
}
