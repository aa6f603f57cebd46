// src/telemetry.rs
use metrics::{describe_counter, describe_gauge, describe_histogram};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up if an exporter is wired).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("archiver_runs_total", "Pipeline runs started.");
        describe_counter!("archiver_publishes_total", "Snapshots force-published.");
        describe_counter!("archiver_clean_runs_total", "Runs that detected no change.");
        describe_counter!(
            "archiver_fetch_errors_total",
            "Per-source fetch failures (run continues)."
        );
        describe_counter!(
            "archiver_normalize_errors_total",
            "Per-source normalization failures (run continues)."
        );
        describe_counter!(
            "archiver_sources_retained_total",
            "Sources that fell back to their last persisted document."
        );
        describe_histogram!("archiver_fetch_ms", "Per-source fetch time in milliseconds.");
        describe_gauge!(
            "archiver_last_run_ts",
            "Unix ts when the pipeline last completed a run."
        );
    });
}
