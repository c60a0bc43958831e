//! Settings-file loading and rule-file loading against a temporary root.

use assert_fs::prelude::*;
use predicates::prelude::*;
use syslogd_core::{config, Action, CoreError, DaemonConfig, ModuleConfig};

// ---------------------------------------------------------------------------
// 1. Settings file
// ---------------------------------------------------------------------------

#[test]
fn corrupt_settings_report_the_path() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    let file = root.child("etc/syslogd.yaml");
    file.write_str(": : corrupt : yaml : !!!\n  - broken: [unclosed")
        .expect("write");

    let err = DaemonConfig::load_default_at(root.path()).unwrap_err();
    assert!(matches!(err, CoreError::Settings { .. }), "got: {err}");
    assert!(err.to_string().contains("syslogd.yaml"), "got: {err}");
}

#[test]
fn wrong_type_settings_are_rejected() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    root.child("etc/syslogd.yaml")
        .write_str("- a list, not a mapping\n")
        .expect("write");
    let err = DaemonConfig::load_default_at(root.path()).unwrap_err();
    assert!(matches!(err, CoreError::Settings { .. }), "got: {err}");
}

#[test]
fn empty_settings_file_is_all_defaults() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    root.child("etc/syslogd.yaml").write_str("\n").expect("write");
    let cfg = DaemonConfig::load_default_at(root.path()).expect("load");
    assert_eq!(cfg, DaemonConfig::with_root(root.path()));
}

#[test]
fn path_helpers_follow_the_root_layout() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    let is_under_root = predicate::str::starts_with(root.path().to_string_lossy().into_owned());
    for path in [
        config::asl_conf_at(root.path()),
        config::module_dir_at(root.path()),
        config::store_dir_at(root.path()),
        config::aux_dir_at(root.path()),
        config::rpc_socket_at(root.path()),
        config::bsd_socket_at(root.path()),
        config::console_socket_at(root.path()),
    ] {
        assert!(is_under_root.eval(&path.to_string_lossy()), "{}", path.display());
    }
    assert!(config::aux_dir_at(root.path()).ends_with("var/log/asl/aux"));
}

// ---------------------------------------------------------------------------
// 2. Rule files
// ---------------------------------------------------------------------------

#[test]
fn module_file_is_named_after_the_file() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    let file = root.child("etc/asl/com.example.app");
    file.write_str(
        "# app logging\n\
         > /var/log/app.log mode=0640 rotate file_max=1m\n\
         ? [= Sender app] file /var/log/app.log\n\
         ? [= Sender app] claim only\n\
         this line is junk\n",
    )
    .expect("write");

    let (module, errors) = ModuleConfig::load_at(file.path(), None).expect("load");
    assert_eq!(module.name, "com.example.app");
    assert_eq!(module.rules.len(), 3);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].to_string().contains("line 5"), "got: {}", errors[0]);

    let opts = module.options_for(std::path::Path::new("/var/log/app.log"));
    assert_eq!(opts.mode, Some(0o640));
    assert!(opts.rotate);
    assert_eq!(opts.file_max, Some(1024 * 1024));
    assert!(module.claims().any(|r| r.action == Action::Claim { only: true }));
}

#[test]
fn missing_module_file_is_an_io_error() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    let err = ModuleConfig::load_at(&root.path().join("etc/asl.conf"), None).unwrap_err();
    assert!(matches!(err, CoreError::Io { .. }), "got: {err}");
    root.child("etc/asl.conf").assert(predicate::path::missing());
}
