//! Feed snapshot archiver — Binary Entrypoint
//! One invocation runs the fetch → normalize → detect → publish pipeline once
//! and exits; the scheduler (cron / CI) decides when invocations happen.

use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tg_rss_archiver::fetch::FetchSettings;
use tg_rss_archiver::{config, GitStore, HttpFetcher, RunGuard, RunOutcome};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tg_rss_archiver=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = match config::load_default() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = ?e, "loading config");
            return ExitCode::FAILURE;
        }
    };

    // The concurrency slot is held for the whole run, including publish; an
    // overlapping trigger is superseded and exits cleanly.
    let guard = match RunGuard::acquire(&cfg.runtime.lock_path, cfg.runtime.run_timeout()) {
        Ok(Some(guard)) => guard,
        Ok(None) => {
            tracing::info!("another run holds the concurrency slot; superseded");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            tracing::error!(error = ?e, "acquiring run lock");
            return ExitCode::FAILURE;
        }
    };

    let fetcher = match HttpFetcher::new(FetchSettings::default()) {
        Ok(f) => Arc::new(f),
        Err(e) => {
            tracing::error!(error = ?e, "building fetcher");
            return ExitCode::FAILURE;
        }
    };
    let store = GitStore::new(cfg.publish.clone());

    // The wall-clock ceiling lives inside run_once; a timeout surfaces here
    // as a plain run failure.
    let code = match tg_rss_archiver::run_once(&cfg, fetcher, &store).await {
        Ok(RunOutcome::Published { commit }) => {
            tracing::info!(commit = %commit, "run finished: published");
            ExitCode::SUCCESS
        }
        Ok(RunOutcome::Clean) => {
            tracing::info!("run finished: no change");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = ?e, "run failed");
            ExitCode::FAILURE
        }
    };

    drop(guard);
    code
}
