use anyhow::Context as _;
use chrono::{Local, NaiveDateTime, TimeZone as _};
use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::events::pine_event;

const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Append-only log file with rename-based rotation.
///
/// Rotation moves the active file aside to `<path>.YYYYMMDD-HHMMSS` (local
/// time), reopens a fresh file at the same path, and prunes stamped siblings
/// older than the retention window. A non-empty file already sitting at the
/// path is rotated away at construction so every run starts on a fresh file.
pub struct RotatingLogFile {
    inner: Mutex<Option<File>>,
    path: PathBuf,
    max_age: Duration,
}

impl RotatingLogFile {
    pub fn open(path: &Path, max_age_days: u32) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create log directory {}", parent.display()))?;
            }
        }
        if let Ok(meta) = fs::metadata(path) {
            if meta.len() > 0 {
                let rotated = stamped_path(path);
                fs::rename(path, &rotated)
                    .with_context(|| format!("initial rotation of {}", path.display()))?;
            }
        }
        let file = open_append(path)?;
        let max_age = Duration::from_secs(u64::from(max_age_days) * 24 * 60 * 60);
        if let Err(e) = prune_old(path, max_age) {
            pine_event(
                "logfile",
                None,
                format!("prune failed path={} err={e:#}", path.display()),
            );
        }
        Ok(Self {
            inner: Mutex::new(Some(file)),
            path: path.to_path_buf(),
            max_age,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `buf` to the active file. Returns the number of bytes written.
    pub fn write(&self, buf: &[u8]) -> anyhow::Result<usize> {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let file = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("log file {} is not open", self.path.display()))?;
        Ok(file.write(buf)?)
    }

    /// Close, rename aside, prune and reopen. A failed rename leaves the
    /// handle closed; writes fail until the next open.
    pub fn rotate(&self) -> anyhow::Result<()> {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.take();
        let rotated = stamped_path(&self.path);
        fs::rename(&self.path, &rotated)
            .with_context(|| format!("rotate {}", self.path.display()))?;
        if let Err(e) = prune_old(&self.path, self.max_age) {
            pine_event(
                "logfile",
                None,
                format!("prune failed path={} err={e:#}", self.path.display()),
            );
        }
        *guard = Some(open_append(&self.path)?);
        Ok(())
    }
}

fn open_append(path: &Path) -> anyhow::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log {}", path.display()))
}

fn stamped_path(path: &Path) -> PathBuf {
    let ts = Local::now().format(STAMP_FORMAT);
    PathBuf::from(format!("{}.{ts}", path.display()))
}

/// Delete rotated siblings of `path` that are past the retention window,
/// along with any empty ones. Files whose suffix does not parse as a
/// rotation stamp are left alone.
fn prune_old(path: &Path, max_age: Duration) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let active = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("unusable log path {}", path.display()))?;
    let cutoff = Local::now() - chrono::Duration::seconds(max_age.as_secs() as i64);

    for entry in
        fs::read_dir(parent).with_context(|| format!("read log directory {}", parent.display()))?
    {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else { continue };
        // A rotation sibling is the active name plus a `.`-delimited
        // suffix; anything else sharing the prefix is not ours to touch.
        let Some(rest) = name.strip_prefix(active) else { continue };
        if !rest.starts_with('.') {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_dir() {
            continue;
        }
        let full = entry.path();
        if meta.len() == 0 {
            match fs::remove_file(&full) {
                Ok(()) => pine_event(
                    "logfile",
                    None,
                    format!("removed empty log file={}", full.display()),
                ),
                Err(e) => pine_event(
                    "logfile",
                    None,
                    format!("failed to remove empty log file={} err={e}", full.display()),
                ),
            }
            continue;
        }
        let stamp = name.rsplit('.').next().unwrap_or("");
        let parsed = match NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT) {
            Ok(ts) => ts,
            Err(_) => {
                pine_event(
                    "logfile",
                    None,
                    format!(
                        "ignoring file with unrecognized stamp file={} stamp={stamp}",
                        full.display()
                    ),
                );
                continue;
            }
        };
        let Some(parsed) = Local.from_local_datetime(&parsed).earliest() else {
            continue;
        };
        if parsed < cutoff {
            match fs::remove_file(&full) {
                Ok(()) => pine_event(
                    "logfile",
                    None,
                    format!("removed old log file={}", full.display()),
                ),
                Err(e) => pine_event(
                    "logfile",
                    None,
                    format!("failed to remove old log file={} err={e}", full.display()),
                ),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_append_to_the_active_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("svc.log");
        let log = RotatingLogFile::open(&path, 7).expect("open");
        assert_eq!(log.write(b"hello ").expect("write"), 6);
        log.write(b"world\n").expect("write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "hello world\n");
    }

    #[test]
    fn creates_missing_parent_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("svc.log");
        let log = RotatingLogFile::open(&path, 7).expect("open");
        log.write(b"x").expect("write");
        assert!(path.exists());
    }

    #[test]
    fn construction_rotates_a_non_empty_predecessor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("svc.log");
        fs::write(&path, "old run\n").expect("seed");

        let log = RotatingLogFile::open(&path, 7).expect("open");
        log.write(b"new run\n").expect("write");

        assert_eq!(fs::read_to_string(&path).expect("read"), "new run\n");
        let rotated: Vec<_> = fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n != "svc.log")
            .collect();
        assert_eq!(rotated.len(), 1, "expected one rotated sibling: {rotated:?}");
        assert!(rotated[0].starts_with("svc.log."));
    }

    #[test]
    fn rotate_keeps_the_active_path_writable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("svc.log");
        let log = RotatingLogFile::open(&path, 7).expect("open");
        log.write(b"before\n").expect("write");

        log.rotate().expect("rotate");
        log.write(b"after\n").expect("write after rotate");

        assert_eq!(fs::read_to_string(&path).expect("read"), "after\n");
        let rotated: Vec<_> = fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p != &path)
            .collect();
        assert_eq!(rotated.len(), 1);
        assert_eq!(fs::read_to_string(&rotated[0]).expect("read rotated"), "before\n");
    }

    #[test]
    fn prune_removes_expired_and_empty_siblings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("svc.log");

        let old_stamp = (Local::now() - chrono::Duration::days(10)).format(STAMP_FORMAT);
        let fresh_stamp = Local::now().format(STAMP_FORMAT);
        let expired = dir.path().join(format!("svc.log.{old_stamp}"));
        let fresh = dir.path().join(format!("svc.log.{fresh_stamp}"));
        let empty = dir.path().join("svc.log.20200101-000000");
        let unstamped = dir.path().join("svc.log.bak");
        // Shares the prefix but has no `.` after it, so it is not a
        // rotation sibling even though it is empty.
        let prefix_only = dir.path().join("svc.log2020");
        fs::write(&expired, "expired\n").expect("seed");
        fs::write(&fresh, "fresh\n").expect("seed");
        fs::write(&empty, "").expect("seed");
        fs::write(&unstamped, "keep me\n").expect("seed");
        fs::write(&prefix_only, "").expect("seed");

        let log = RotatingLogFile::open(&path, 7).expect("open");
        log.write(b"active\n").expect("write");

        assert!(!expired.exists(), "expired sibling should be pruned");
        assert!(!empty.exists(), "empty sibling should be pruned");
        assert!(fresh.exists(), "fresh sibling should survive");
        assert!(unstamped.exists(), "unparseable suffix should survive");
        assert!(prefix_only.exists(), "undotted prefix neighbor should survive");
    }
}
