// src/publish.rs
//
// Persistence store boundary. The store holds exactly one snapshot record:
// every publish amends the previous commit and force-pushes, so history depth
// stays 1 no matter how many dirty runs happen.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Output;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::config::PublishConfig;
use crate::snapshot::{PersistedState, Snapshot};

const DEFAULT_MESSAGE: &str = "Refresh feed snapshots";
const ARTIFACT_EXT: &str = "rdf";

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// The store's state as of run start; `None` on the very first run.
    async fn read_last(&self) -> Result<Option<PersistedState>>;

    /// Stage, commit-replacing-prior, force-publish. Returns the new commit
    /// id. Only called on a dirty verdict; failure leaves the remote at its
    /// prior value.
    async fn publish(&self, snapshot: &Snapshot, message: Option<&str>) -> Result<String>;
}

fn artifact_name(id: &str) -> String {
    format!("{id}.{ARTIFACT_EXT}")
}

/// Git fetch of a branch that was never pushed; the bootstrap case, not an
/// outage.
fn is_missing_remote_ref(stderr: &str) -> bool {
    stderr.contains("couldn't find remote ref") || stderr.contains("Couldn't find remote ref")
}

/// Store commands are killed when their future is dropped; a run cancelled
/// by the wall-clock ceiling must not leave a push finishing in the
/// background underneath the next holder of the concurrency slot.
fn store_command(program: &str, workdir: &Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.current_dir(workdir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .kill_on_drop(true);
    cmd
}

/// Publishes into a branch of a git remote. All staging happens in a local
/// worktree that is re-synced from the remote on every run; the force-push at
/// the end is the only externally visible step.
pub struct GitStore {
    cfg: PublishConfig,
    /// HEAD commit observed by `read_last`, reused by `publish` so both steps
    /// of one run see the same base. `None` until synced.
    head: Mutex<Option<Option<String>>>,
}

impl GitStore {
    pub fn new(cfg: PublishConfig) -> Self {
        Self {
            cfg,
            head: Mutex::new(None),
        }
    }

    async fn git(&self, args: &[&str]) -> Result<Output> {
        store_command("git", &self.cfg.workdir)
            .args(args)
            .output()
            .await
            .with_context(|| format!("running git {}", args.join(" ")))
    }

    async fn git_ok(&self, args: &[&str]) -> Result<String> {
        let out = self.git(args).await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    /// Recreate the worktree from scratch and sync it to the remote branch.
    /// Returns the branch tip, or `None` when the branch does not exist yet.
    async fn sync(&self) -> Result<Option<String>> {
        let workdir = &self.cfg.workdir;
        if workdir.exists() {
            tokio::fs::remove_dir_all(workdir)
                .await
                .with_context(|| format!("clearing worktree {}", workdir.display()))?;
        }
        tokio::fs::create_dir_all(workdir)
            .await
            .with_context(|| format!("creating worktree {}", workdir.display()))?;

        self.git_ok(&["init", "-q"]).await?;
        self.git_ok(&["remote", "add", "origin", &self.cfg.remote])
            .await?;

        let fetch = self
            .git(&["fetch", "-q", "origin", &self.cfg.branch])
            .await?;
        if fetch.status.success() {
            self.git_ok(&["checkout", "-q", "-B", &self.cfg.branch, "FETCH_HEAD"])
                .await?;
            let head = self.git_ok(&["rev-parse", "HEAD"]).await?;
            Ok(Some(head))
        } else {
            let stderr = String::from_utf8_lossy(&fetch.stderr);
            if is_missing_remote_ref(&stderr) {
                self.git_ok(&["checkout", "-q", "--orphan", &self.cfg.branch])
                    .await?;
                Ok(None)
            } else {
                // Unreachable remote is a store error, never bootstrap.
                Err(anyhow!("git fetch failed: {}", stderr.trim()))
            }
        }
    }

    fn read_snapshot_dir(dir: &Path) -> Result<Snapshot> {
        let mut snapshot = Snapshot::default();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("reading worktree {}", dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some(ARTIFACT_EXT) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let doc = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            snapshot.insert(id, doc);
        }
        Ok(snapshot)
    }

    fn write_snapshot_dir(dir: &Path, snapshot: &Snapshot) -> Result<()> {
        // Drop artifacts for sources no longer configured; `add -A` picks up
        // the deletions.
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some(ARTIFACT_EXT) {
                continue;
            }
            let stale = path
                .file_stem()
                .and_then(|s| s.to_str())
                .is_none_or(|id| snapshot.get(id).is_none());
            if stale {
                std::fs::remove_file(&path)
                    .with_context(|| format!("removing {}", path.display()))?;
            }
        }
        for (id, doc) in snapshot.iter() {
            let path = dir.join(artifact_name(id));
            std::fs::write(&path, doc).with_context(|| format!("writing {}", path.display()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for GitStore {
    async fn read_last(&self) -> Result<Option<PersistedState>> {
        let head = self.sync().await?;
        *self.head.lock().await = Some(head.clone());
        match head {
            None => Ok(None),
            Some(commit) => {
                let snapshot = Self::read_snapshot_dir(&self.cfg.workdir)?;
                Ok(Some(PersistedState {
                    snapshot,
                    commit: Some(commit),
                }))
            }
        }
    }

    async fn publish(&self, snapshot: &Snapshot, message: Option<&str>) -> Result<String> {
        let base = match self.head.lock().await.clone() {
            Some(head) => head,
            None => {
                let head = self.sync().await?;
                *self.head.lock().await = Some(head.clone());
                head
            }
        };

        Self::write_snapshot_dir(&self.cfg.workdir, snapshot)?;
        self.git_ok(&["add", "-A"]).await?;

        let email = self.cfg.bot_email();
        let name_cfg = format!("user.name={}", self.cfg.bot_name);
        let email_cfg = format!("user.email={email}");
        let msg = message.unwrap_or(DEFAULT_MESSAGE);

        let mut args = vec!["-c", &name_cfg, "-c", &email_cfg, "commit", "-q", "-m", msg];
        if base.is_some() {
            args.push("--amend");
        }
        self.git_ok(&args).await?;

        self.git_ok(&["push", "-q", "--force", "origin", &self.cfg.branch])
            .await?;

        let commit = self.git_ok(&["rev-parse", "HEAD"]).await?;
        *self.head.lock().await = Some(Some(commit.clone()));
        tracing::info!(
            commit = %commit,
            digest = %snapshot.short_digest(),
            "snapshot force-published"
        );
        Ok(commit)
    }
}

// --- Test helper ---
/// In-memory store with the same replace-not-append semantics; records the
/// publish count so tests can assert no write happened on clean runs.
pub struct MemoryStore {
    records: std::sync::Mutex<Vec<(Snapshot, String)>>,
    publishes: std::sync::atomic::AtomicUsize,
    fail_publish: std::sync::atomic::AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: std::sync::Mutex::new(vec![]),
            publishes: std::sync::atomic::AtomicUsize::new(0),
            fail_publish: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn with_state(snapshot: Snapshot) -> Self {
        let store = Self::new();
        store
            .records
            .lock()
            .unwrap()
            .push((snapshot, "seed-0".to_string()));
        store
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn publish_count(&self) -> usize {
        self.publishes.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Number of records currently held; the replace invariant keeps it ≤ 1.
    pub fn history_depth(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn last_snapshot(&self) -> Option<Snapshot> {
        self.records.lock().unwrap().last().map(|(s, _)| s.clone())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn read_last(&self) -> Result<Option<PersistedState>> {
        Ok(self.records.lock().unwrap().last().map(|(s, c)| {
            PersistedState {
                snapshot: s.clone(),
                commit: Some(c.clone()),
            }
        }))
    }

    async fn publish(&self, snapshot: &Snapshot, _message: Option<&str>) -> Result<String> {
        if self.fail_publish.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(anyhow!("store unavailable"));
        }
        let n = self
            .publishes
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        let commit = format!("mem-{n}");
        let mut records = self.records.lock().unwrap();
        records.clear();
        records.push((snapshot.clone(), commit.clone()));
        Ok(commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn artifact_naming() {
        assert_eq!(artifact_name("ai_newz"), "ai_newz.rdf");
    }

    #[tokio::test]
    async fn cancelled_store_command_performs_no_side_effect() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("pushed");

        // Same construction path GitStore uses; the command outlives the
        // cancellation only if kill-on-drop is missing.
        let script = format!("sleep 2 && touch {}", marker.display());
        let fut = store_command("sh", tmp.path())
            .args(["-c", &script])
            .output();
        let cancelled = tokio::time::timeout(Duration::from_millis(100), fut).await;
        assert!(cancelled.is_err());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(
            !marker.exists(),
            "cancelled command must not complete its write"
        );
    }

    #[test]
    fn missing_ref_detection() {
        assert!(is_missing_remote_ref(
            "fatal: couldn't find remote ref gh-pages"
        ));
        assert!(!is_missing_remote_ref(
            "fatal: unable to access 'https://example.test/': timeout"
        ));
    }

    #[tokio::test]
    async fn memory_store_replaces_not_appends() {
        let store = MemoryStore::new();
        assert!(store.read_last().await.unwrap().is_none());

        let mut a = Snapshot::default();
        a.insert("x", "1");
        let c1 = store.publish(&a, None).await.unwrap();

        let mut b = Snapshot::default();
        b.insert("x", "2");
        let c2 = store.publish(&b, None).await.unwrap();

        assert_ne!(c1, c2);
        assert_eq!(store.history_depth(), 1);
        assert_eq!(store.publish_count(), 2);
        assert_eq!(
            store.read_last().await.unwrap().unwrap().snapshot.get("x"),
            Some("2")
        );
    }

    #[tokio::test]
    async fn memory_store_failure_keeps_prior_record() {
        let mut seed = Snapshot::default();
        seed.insert("x", "old");
        let store = MemoryStore::with_state(seed);
        store.set_fail_publish(true);

        let mut next = Snapshot::default();
        next.insert("x", "new");
        assert!(store.publish(&next, None).await.is_err());
        assert_eq!(store.last_snapshot().unwrap().get("x"), Some("old"));
    }
}
