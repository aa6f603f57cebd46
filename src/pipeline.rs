// src/pipeline.rs
//
// One invocation = one strict forward pass:
// START → FETCHING → NORMALIZING → DETECTING → {PUBLISHING → DONE | DONE}.
// The persisted state is read once at run start and written at most once at
// run end; per-source failures fall back to the last persisted document.
use anyhow::{anyhow, Context, Result};
use metrics::{counter, gauge};
use std::sync::Arc;

use crate::config::Config;
use crate::detect::{detect, RunVerdict};
use crate::fetch::{fetch_all, FeedFetcher};
use crate::normalize::render_channel;
use crate::publish::SnapshotStore;
use crate::snapshot::Snapshot;
use crate::telemetry::ensure_metrics_described;

/// Terminal result of a run; failures propagate as errors instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Published { commit: String },
    Clean,
}

/// One bounded run. The whole pass, including the publish, lives under the
/// configured wall-clock ceiling; exceeding it fails the run with no publish
/// (cancellation tears down any in-flight store command, so a terminated run
/// leaves the persisted state untouched).
pub async fn run_once(
    cfg: &Config,
    fetcher: Arc<dyn FeedFetcher>,
    store: &dyn SnapshotStore,
) -> Result<RunOutcome> {
    match tokio::time::timeout(cfg.runtime.run_timeout(), run_pipeline(cfg, fetcher, store)).await
    {
        Ok(result) => result,
        Err(_) => Err(anyhow!(
            "run exceeded wall-clock budget of {}s",
            cfg.runtime.run_timeout_secs
        )),
    }
}

async fn run_pipeline(
    cfg: &Config,
    fetcher: Arc<dyn FeedFetcher>,
    store: &dyn SnapshotStore,
) -> Result<RunOutcome> {
    ensure_metrics_described();
    counter!("archiver_runs_total").increment(1);

    let previous = store
        .read_last()
        .await
        .context("reading last persisted snapshot")?;
    let prev_snapshot = previous.as_ref().map(|p| &p.snapshot);

    // FETCHING
    let report = fetch_all(fetcher, &cfg.sources, cfg.runtime.fetch_concurrency).await;

    // NORMALIZING — per-source fallback keeps one bad feed from poisoning the
    // rest or causing a spurious "feed disappeared" diff.
    let mut snapshot = Snapshot::default();
    for source in &cfg.sources {
        match report.ok.get(&source.id) {
            Some(html) => match render_channel(source, html) {
                Ok(doc) => snapshot.insert(source.id.clone(), doc),
                Err(e) => {
                    tracing::warn!(error = ?e, source = %source.id, "normalization error");
                    counter!("archiver_normalize_errors_total").increment(1);
                    retain_previous(&mut snapshot, prev_snapshot, &source.id);
                }
            },
            None => retain_previous(&mut snapshot, prev_snapshot, &source.id),
        }
    }

    // DETECTING
    let verdict = detect(&snapshot, prev_snapshot);
    gauge!("archiver_last_run_ts").set(chrono::Utc::now().timestamp().max(0) as f64);

    match verdict {
        RunVerdict::Clean => {
            counter!("archiver_clean_runs_total").increment(1);
            tracing::info!(digest = %snapshot.short_digest(), "no change detected");
            Ok(RunOutcome::Clean)
        }
        RunVerdict::Dirty => {
            // PUBLISHING
            let commit = store
                .publish(&snapshot, None)
                .await
                .context("publishing snapshot")?;
            counter!("archiver_publishes_total").increment(1);
            tracing::info!(
                commit = %commit,
                sources = snapshot.len(),
                digest = %snapshot.short_digest(),
                "snapshot published"
            );
            Ok(RunOutcome::Published { commit })
        }
    }
}

fn retain_previous(snapshot: &mut Snapshot, previous: Option<&Snapshot>, id: &str) {
    match previous.and_then(|p| p.get(id)) {
        Some(doc) => {
            counter!("archiver_sources_retained_total").increment(1);
            tracing::warn!(source = %id, "retaining last persisted document");
            snapshot.insert(id, doc.to_string());
        }
        None => {
            // First run for this source and the fetch already failed; there
            // is nothing to retain, so it is absent until the next run.
            tracing::warn!(source = %id, "no prior document to retain; source omitted");
        }
    }
}
