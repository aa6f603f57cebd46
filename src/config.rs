// src/config.rs
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PATH: &str = "ARCHIVER_CONFIG_PATH";
const DEFAULT_PATH: &str = "config/feeds.toml";

/// Public channel pages live under this prefix; `endpoint()` derives the URL.
const BASE_URL: &str = "https://t.me/s/";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct FeedSource {
    /// Stable identifier; also the output artifact name (`{id}.rdf`).
    pub id: String,
    /// Telegram channel slug, e.g. "opendatascience".
    pub channel: String,
}

impl FeedSource {
    pub fn endpoint(&self) -> String {
        format!("{BASE_URL}{}", self.channel)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishConfig {
    /// Remote the snapshot branch is force-pushed to.
    pub remote: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Local worktree the store syncs and commits in.
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,
    #[serde(default = "default_bot_name")]
    pub bot_name: String,
    /// Derived from `bot_name` when absent.
    #[serde(default)]
    pub bot_email: Option<String>,
}

impl PublishConfig {
    /// Fixed automation identity, never a human author.
    pub fn bot_email(&self) -> String {
        self.bot_email
            .clone()
            .unwrap_or_else(|| format!("{}@users.noreply.github.com", self.bot_name))
    }
}

fn default_branch() -> String {
    "gh-pages".to_string()
}
fn default_workdir() -> PathBuf {
    PathBuf::from("state/worktree")
}
fn default_bot_name() -> String {
    "tg-rss-archiver".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Wall-clock ceiling for a whole run; exceeding it is a failure.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    /// Bounded fan-out across feed fetches.
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,
}

impl RuntimeConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            run_timeout_secs: default_run_timeout_secs(),
            fetch_concurrency: default_fetch_concurrency(),
            lock_path: default_lock_path(),
        }
    }
}

fn default_run_timeout_secs() -> u64 {
    300
}
fn default_fetch_concurrency() -> usize {
    4
}
fn default_lock_path() -> PathBuf {
    PathBuf::from("state/run.lock")
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "source")]
    pub sources: Vec<FeedSource>,
    pub publish: PublishConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Load config from an explicit path.
pub fn load_from(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading config from {}", path.display()))?;
    parse_config(&content)
}

/// Load config using env var + fallback:
/// 1) $ARCHIVER_CONFIG_PATH
/// 2) config/feeds.toml
pub fn load_default() -> Result<Config> {
    if let Ok(p) = std::env::var(ENV_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_from(&pb);
        } else {
            return Err(anyhow!("ARCHIVER_CONFIG_PATH points to non-existent path"));
        }
    }
    load_from(Path::new(DEFAULT_PATH))
}

fn parse_config(s: &str) -> Result<Config> {
    let mut cfg: Config = toml::from_str(s).context("parsing config TOML")?;
    validate(&mut cfg)?;
    Ok(cfg)
}

/// Trim, reject empties/duplicates, and fix the source order by id so the
/// source set reads the same on every run.
fn validate(cfg: &mut Config) -> Result<()> {
    if cfg.sources.is_empty() {
        return Err(anyhow!("config declares no [[source]] entries"));
    }
    let mut seen = BTreeSet::new();
    for s in &mut cfg.sources {
        s.id = s.id.trim().to_string();
        s.channel = s.channel.trim().to_string();
        if s.id.is_empty() || s.channel.is_empty() {
            return Err(anyhow!("source with empty id or channel"));
        }
        if !seen.insert(s.id.clone()) {
            return Err(anyhow!("duplicate source id: {}", s.id));
        }
    }
    cfg.sources.sort_by(|a, b| a.id.cmp(&b.id));
    if cfg.publish.remote.trim().is_empty() {
        return Err(anyhow!("publish.remote must not be empty"));
    }
    Ok(())
}
