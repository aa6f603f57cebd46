// src/guard.rs
//
// The single named concurrency slot. Acquired before fetching, released on
// drop, so two overlapping triggers can never both reach the publisher.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    /// Distinguishes guards from the same process; pid alone is ambiguous.
    #[serde(default)]
    token: u64,
    acquired_at: DateTime<Utc>,
}

impl LockInfo {
    fn fresh() -> Self {
        static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);
        Self {
            pid: std::process::id(),
            token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
            acquired_at: Utc::now(),
        }
    }
}

/// Exclusive run token backed by a lock file. A second `acquire` on the same
/// path returns `Ok(None)` while the first guard lives; that trigger is
/// superseded, never queued. A lock older than `stale_after` is assumed to
/// belong to a dead or killed run and is broken with a warning.
#[derive(Debug)]
pub struct RunGuard {
    path: PathBuf,
    info: LockInfo,
}

impl RunGuard {
    pub fn acquire(path: &Path, stale_after: Duration) -> Result<Option<RunGuard>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating lock dir {}", parent.display()))?;
        }
        match Self::try_create(path) {
            Ok(guard) => Ok(Some(guard)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let Ok(seen) = std::fs::read_to_string(path) else {
                    // Holder released between create and read; next trigger
                    // gets the slot.
                    return Ok(None);
                };
                if !content_is_stale(&seen, path, stale_after) {
                    return Ok(None);
                }
                // Re-read immediately before removal and only break the
                // exact lock judged stale; if it changed, someone else beat
                // us to it and now holds the slot.
                match std::fs::read_to_string(path) {
                    Ok(current) if current == seen => {}
                    _ => return Ok(None),
                }
                tracing::warn!(lock = %path.display(), "breaking stale run lock");
                std::fs::remove_file(path)
                    .with_context(|| format!("removing stale lock {}", path.display()))?;
                match Self::try_create(path) {
                    Ok(guard) => Ok(Some(guard)),
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
                    Err(e) => Err(e).with_context(|| format!("creating lock {}", path.display())),
                }
            }
            Err(e) => Err(e).with_context(|| format!("creating lock {}", path.display())),
        }
    }

    fn try_create(path: &Path) -> std::io::Result<RunGuard> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let info = LockInfo::fresh();
        file.write_all(&serde_json::to_vec(&info).unwrap_or_default())?;
        Ok(RunGuard {
            path: path.to_path_buf(),
            info,
        })
    }
}

fn content_is_stale(content: &str, path: &Path, stale_after: Duration) -> bool {
    let Ok(info) = serde_json::from_str::<LockInfo>(content) else {
        // Unparseable lock file; age it via mtime instead of wedging forever.
        return std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())
            .is_some_and(|age| age > stale_after);
    };
    let age = Utc::now() - info.acquired_at;
    age.to_std().is_ok_and(|age| age > stale_after)
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        // Only delete a lock this guard still owns; if it was broken and
        // re-acquired by another trigger, the file is theirs now.
        match std::fs::read_to_string(&self.path) {
            Ok(content) if serde_json::from_str::<LockInfo>(&content).ok() == Some(self.info.clone()) => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    tracing::warn!(error = ?e, lock = %self.path.display(), "releasing run lock");
                }
            }
            Ok(_) => {
                tracing::warn!(lock = %self.path.display(), "run lock taken over; leaving it");
            }
            Err(e) => {
                tracing::warn!(error = ?e, lock = %self.path.display(), "reading run lock on release");
            }
        }
    }
}
