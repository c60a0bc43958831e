use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use assert_cmd::prelude::*;
use predicates::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

fn syslogd_cmd(root: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("syslogd"));
    cmd.arg("--root").arg(root).env("RUST_LOG", "warn");
    cmd
}

struct RunningDaemon {
    child: Child,
}

impl Drop for RunningDaemon {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn spawn_daemon(root: &Path) -> RunningDaemon {
    let child = syslogd_cmd(root)
        .arg("start")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn daemon");
    let socket = root.join("var/run/syslogd.sock");
    let deadline = Instant::now() + Duration::from_secs(10);
    while !socket.exists() {
        assert!(Instant::now() < deadline, "daemon socket never appeared");
        sleep(Duration::from_millis(50));
    }
    RunningDaemon { child }
}

#[test]
fn help_lists_every_subcommand() {
    let root = TempDir::new().expect("root");
    let assert = syslogd_cmd(root.path()).arg("--help").assert().success();
    let mut out = assert.get_output().stdout.clone();
    out.retain(|b| *b != b'\r');
    let out = String::from_utf8(out).expect("utf8");
    for sub in ["start", "stop", "status", "query", "watch", "submit", "control", "console"] {
        assert!(out.contains(sub), "missing {sub} in:\n{out}");
    }
}

#[test]
fn status_without_a_daemon_says_so() {
    let root = TempDir::new().expect("root");
    syslogd_cmd(root.path())
        .arg("status")
        .assert()
        .success()
        .stdout(contains("not running"));
    syslogd_cmd(root.path())
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(contains("\"running\": false"));
}

#[test]
fn query_without_a_daemon_fails() {
    let root = TempDir::new().expect("root");
    syslogd_cmd(root.path())
        .args(["query", "[= Sender x]"])
        .assert()
        .failure()
        .stderr(contains("not running"));
}

#[test]
fn malformed_settings_are_reported_with_their_path() {
    let root = TempDir::new().expect("root");
    std::fs::create_dir_all(root.path().join("etc")).expect("etc");
    std::fs::write(root.path().join("etc/syslogd.yaml"), "queue_capacity: [nope\n")
        .expect("settings");
    syslogd_cmd(root.path())
        .arg("status")
        .assert()
        .failure()
        .stderr(contains("syslogd.yaml"));
}

#[test]
fn submit_then_query_through_a_running_daemon() {
    let root = TempDir::new().expect("root");
    let daemon = spawn_daemon(root.path());

    syslogd_cmd(root.path())
        .args(["submit", "--sender", "clitest", "--level", "error", "disk", "almost", "full"])
        .assert()
        .success()
        .stdout(contains("accepted"));

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let output = syslogd_cmd(root.path())
            .args(["query", "--format", "msg", "[= Sender clitest]"])
            .output()
            .expect("query");
        assert!(output.status.success());
        if String::from_utf8_lossy(&output.stdout).contains("disk almost full") {
            break;
        }
        assert!(Instant::now() < deadline, "record never became queryable");
        sleep(Duration::from_millis(50));
    }

    syslogd_cmd(root.path())
        .args(["console", "-c", "stats"])
        .assert()
        .success()
        .stdout(contains("Records").and(contains("> ")));

    syslogd_cmd(root.path())
        .arg("stop")
        .assert()
        .success()
        .stdout(contains("stop requested"));

    let mut daemon = daemon;
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if daemon.child.try_wait().expect("wait").is_some() {
            break;
        }
        assert!(Instant::now() < deadline, "daemon did not exit after stop");
        sleep(Duration::from_millis(50));
    }
}
