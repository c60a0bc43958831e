//! Checkpoint rotation for file destinations.
//!
//! A checkpoint moves the live file aside as an archive; the destination
//! reopens a fresh file lazily on its next write. Archive names follow the
//! destination's style:
//!
//! | style | archive of `app.log`         |
//! |-------|------------------------------|
//! | seq   | `app.log.1` (newest), `.2` … |
//! | sec   | `app.log.1709294400`         |
//! | utc   | `app.log.20240301T120000Z`   |
//! | lcl   | `app.log.20240301T040000-0800` |
//!
//! Archives are pruned by age (`ttl` days) and by total size (`all_max`),
//! oldest first.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local, Utc};

use syslogd_core::{DestinationOptions, RotationStyle};

/// Called after every archive is created.
pub trait ArchiveHook: Send {
    fn archived(&mut self, source: &Path, archive: &Path, options: &DestinationOptions);
}

/// Default hook: record the archive in the daemon log.
#[derive(Debug, Default)]
pub struct LogArchiveHook;

impl ArchiveHook for LogArchiveHook {
    fn archived(&mut self, source: &Path, archive: &Path, options: &DestinationOptions) {
        tracing::info!(
            "archived {} as {}{}",
            source.display(),
            archive.display(),
            if options.compress { " (compress requested)" } else { "" }
        );
    }
}

/// Build the path for the `n`-th sequenced copy of `base` (e.g. `app.log.2`).
pub fn numbered_path(base: &Path, n: usize) -> PathBuf {
    with_suffix(base, &n.to_string())
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let name = base
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("syslog");
    base.with_file_name(format!("{name}.{suffix}"))
}

/// Archive path for a timestamped style; sequenced archives always use `.1`.
pub fn archive_path(base: &Path, style: RotationStyle, now: DateTime<Utc>) -> PathBuf {
    match style {
        RotationStyle::Sequenced => numbered_path(base, 1),
        RotationStyle::Seconds => with_suffix(base, &now.timestamp().to_string()),
        RotationStyle::Utc => with_suffix(base, &now.format("%Y%m%dT%H%M%SZ").to_string()),
        RotationStyle::Local => with_suffix(
            base,
            &now.with_timezone(&Local).format("%Y%m%dT%H%M%S%z").to_string(),
        ),
    }
}

/// Move `base` aside as an archive.
///
/// Returns the archive path, or `None` if there was nothing to rotate (the
/// file is missing or empty).
pub fn rotate(base: &Path, style: RotationStyle, now: DateTime<Utc>) -> io::Result<Option<PathBuf>> {
    let size = match fs::metadata(base) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    if size == 0 {
        return Ok(None);
    }

    let target = match style {
        RotationStyle::Sequenced => {
            // Shift existing copies up by one, highest first.
            let mut highest = 0;
            while numbered_path(base, highest + 1).exists() {
                highest += 1;
            }
            for n in (1..=highest).rev() {
                fs::rename(numbered_path(base, n), numbered_path(base, n + 1))?;
            }
            numbered_path(base, 1)
        }
        _ => {
            let mut target = archive_path(base, style, now);
            let mut n = 1;
            while target.exists() {
                target = with_suffix(&archive_path(base, style, now), &n.to_string());
                n += 1;
            }
            target
        }
    };
    fs::rename(base, &target)?;
    Ok(Some(target))
}

/// Every archive of `base`: siblings named `<name>.<suffix>`.
pub fn archives_of(base: &Path) -> io::Result<Vec<PathBuf>> {
    let Some(dir) = base.parent() else {
        return Ok(vec![]);
    };
    let Some(name) = base.file_name().and_then(|s| s.to_str()) else {
        return Ok(vec![]);
    };
    let prefix = format!("{name}.");
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
        Err(err) => return Err(err),
    };
    let mut out = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_archive = path
            .file_name()
            .and_then(|s| s.to_str())
            .is_some_and(|n| n.starts_with(&prefix));
        if is_archive && path.is_file() {
            out.push(path);
        }
    }
    Ok(out)
}

/// Remove archives of `base` older than `ttl_days`, then the oldest ones
/// while their total size exceeds `all_max`. Returns what was removed.
pub fn prune_archives(
    base: &Path,
    all_max: Option<u64>,
    ttl_days: Option<u32>,
    now: SystemTime,
) -> io::Result<Vec<PathBuf>> {
    let mut archives: Vec<(PathBuf, SystemTime, u64)> = Vec::new();
    for path in archives_of(base)? {
        let meta = fs::metadata(&path)?;
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        archives.push((path, mtime, meta.len()));
    }
    archives.sort_by_key(|(_, mtime, _)| *mtime);

    let mut removed = Vec::new();
    if let Some(days) = ttl_days.filter(|d| *d > 0) {
        let max_age = Duration::from_secs(u64::from(days) * 86_400);
        let mut kept = Vec::new();
        for (path, mtime, len) in archives {
            let age = now.duration_since(mtime).unwrap_or_default();
            if age > max_age {
                fs::remove_file(&path)?;
                removed.push(path);
            } else {
                kept.push((path, mtime, len));
            }
        }
        archives = kept;
    }

    if let Some(max) = all_max.filter(|m| *m > 0) {
        let mut total: u64 = archives.iter().map(|(_, _, len)| len).sum();
        for (path, _, len) in archives {
            if total <= max {
                break;
            }
            fs::remove_file(&path)?;
            total = total.saturating_sub(len);
            removed.push(path);
        }
    }
    Ok(removed)
}

// ─── Tests ────────────────────────────────────────────────────────────────────
