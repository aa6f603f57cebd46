// src/fetch.rs
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use metrics::{counter, histogram};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::FeedSource;

#[async_trait]
pub trait FeedFetcher: Send + Sync {
    /// Current page content for one source. Network I/O only; no shared state.
    async fn fetch(&self, source: &FeedSource) -> Result<String>;
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(settings: FetchSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.request_timeout)
            .build()
            .context("building http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FeedFetcher for HttpFetcher {
    async fn fetch(&self, source: &FeedSource) -> Result<String> {
        let url = source.endpoint();
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("GET {url} returned {status}"));
        }
        resp.text().await.with_context(|| format!("{url} body"))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Outcome of one fan-out round: page per successful source, ids of failures.
/// Failures never abort the round; the pipeline falls back per source.
#[derive(Debug, Default)]
pub struct FetchReport {
    pub ok: BTreeMap<String, String>,
    pub failed: Vec<String>,
}

/// Fetch all sources with bounded concurrency. Each task writes only its own
/// slot; results are merged after the set drains, so order of completion does
/// not matter.
pub async fn fetch_all(
    fetcher: Arc<dyn FeedFetcher>,
    sources: &[FeedSource],
    limit: usize,
) -> FetchReport {
    let limit = limit.max(1);
    let semaphore = Arc::new(Semaphore::new(limit));
    let mut set = JoinSet::new();

    for source in sources.iter().cloned() {
        let fetcher = Arc::clone(&fetcher);
        let semaphore = Arc::clone(&semaphore);
        set.spawn(async move {
            // Closed only when the set is dropped, which we never do mid-drain.
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            let t0 = std::time::Instant::now();
            let result = fetcher.fetch(&source).await;
            histogram!("archiver_fetch_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
            (source.id, result)
        });
    }

    let mut report = FetchReport::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((id, Ok(body))) => {
                report.ok.insert(id, body);
            }
            Ok((id, Err(e))) => {
                tracing::warn!(error = ?e, source = %id, "source fetch error");
                counter!("archiver_fetch_errors_total").increment(1);
                report.failed.push(id);
            }
            Err(e) => {
                // Task panic; surfaced, not swallowed. The source ends up in
                // neither bucket and the pipeline treats it as failed.
                tracing::warn!(error = ?e, "fetch task join error");
                counter!("archiver_fetch_errors_total").increment(1);
            }
        }
    }
    report.failed.sort();
    report
}

// --- Test helper ---
/// Serves canned pages keyed by source id; missing ids fail the fetch.
pub struct StaticFetcher {
    pages: BTreeMap<String, String>,
}

impl StaticFetcher {
    pub fn new(pages: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            pages: pages.into_iter().collect(),
        }
    }
}

#[async_trait]
impl FeedFetcher for StaticFetcher {
    async fn fetch(&self, source: &FeedSource) -> Result<String> {
        self.pages
            .get(&source.id)
            .cloned()
            .ok_or_else(|| anyhow!("no canned page for {}", source.id))
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src(id: &str) -> FeedSource {
        FeedSource {
            id: id.to_string(),
            channel: id.to_string(),
        }
    }

    #[tokio::test]
    async fn fan_out_partitions_successes_and_failures() {
        let fetcher = Arc::new(StaticFetcher::new([
            ("a".to_string(), "page-a".to_string()),
            ("c".to_string(), "page-c".to_string()),
        ]));
        let sources = vec![src("a"), src("b"), src("c")];
        let report = fetch_all(fetcher, &sources, 2).await;
        assert_eq!(report.ok.get("a").map(String::as_str), Some("page-a"));
        assert_eq!(report.ok.get("c").map(String::as_str), Some("page-c"));
        assert_eq!(report.failed, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn zero_limit_is_clamped() {
        let fetcher = Arc::new(StaticFetcher::new([("a".to_string(), "x".to_string())]));
        let report = fetch_all(fetcher, &[src("a")], 0).await;
        assert_eq!(report.ok.len(), 1);
    }
}
