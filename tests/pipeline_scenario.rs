// tests/pipeline_scenario.rs
//
// The end-to-end scenario: bootstrap publish, clean tick, single-source
// change republishes, and the store holds exactly one record throughout.
// Also: a trigger arriving mid-run is superseded by the lock, and the
// follow-up run baselines on the first run's published snapshot.
use std::sync::Arc;
use std::time::Duration;

use tg_rss_archiver::config::{Config, PublishConfig, RuntimeConfig};
use tg_rss_archiver::{
    run_once, FeedSource, MemoryStore, RunGuard, RunOutcome, SnapshotStore, StaticFetcher,
};

fn cfg(ids: &[&str]) -> Config {
    Config {
        sources: ids
            .iter()
            .map(|id| FeedSource {
                id: id.to_string(),
                channel: id.to_string(),
            })
            .collect(),
        publish: PublishConfig {
            remote: "unused-by-memory-store".to_string(),
            branch: "gh-pages".to_string(),
            workdir: "state/worktree".into(),
            bot_name: "tg-rss-archiver".to_string(),
            bot_email: None,
        },
        runtime: RuntimeConfig::default(),
    }
}

fn page(channel: &str, marker: &str) -> String {
    format!(
        r#"<html><head>
        <meta property="og:title" content="{channel}">
        <meta property="og:description" content="feed">
        </head><body>
        <div class="tgme_widget_message_wrap">
          <div class="js-message_text"><b>{marker}</b> body</div>
          <span class="tgme_widget_message_from_author">bot</span>
          <a class="tgme_widget_message_date" href="https://t.me/{channel}/1">
            <time class="time" datetime="2024-05-12T12:00:00+00:00"></time>
          </a>
        </div>
        </body></html>"#
    )
}

fn fetcher(pages: &[(&str, &str)]) -> Arc<StaticFetcher> {
    Arc::new(StaticFetcher::new(
        pages
            .iter()
            .map(|(id, marker)| (id.to_string(), page(id, marker))),
    ))
}

#[tokio::test]
async fn bootstrap_clean_then_single_source_change() {
    let cfg = cfg(&["A", "B"]);
    let store = MemoryStore::new();

    // No PersistedState → bootstrap dirty, publishes {A:v1, B:v1}.
    let outcome = run_once(&cfg, fetcher(&[("A", "v1"), ("B", "v1")]), &store)
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Published { .. }));
    assert_eq!(store.history_depth(), 1);

    // Unchanged content → clean, no publish.
    let outcome = run_once(&cfg, fetcher(&[("A", "v1"), ("B", "v1")]), &store)
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Clean);
    assert_eq!(store.publish_count(), 1);

    // A → v2 → dirty; replacement holds {A:v2, B:v1}; still one record.
    let outcome = run_once(&cfg, fetcher(&[("A", "v2"), ("B", "v1")]), &store)
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Published { .. }));
    assert_eq!(store.publish_count(), 2);
    assert_eq!(store.history_depth(), 1);

    let snap = store.last_snapshot().unwrap();
    assert!(snap.get("A").unwrap().contains("v2"));
    assert!(snap.get("B").unwrap().contains("v1"));
}

#[tokio::test]
async fn overlapping_trigger_is_superseded_and_next_run_sees_fresh_baseline() {
    let tmp = tempfile::tempdir().unwrap();
    let lock = tmp.path().join("run.lock");
    let stale = Duration::from_secs(3600);

    let cfg = cfg(&["A"]);
    let store = MemoryStore::new();

    // First trigger takes the slot and runs to completion.
    let guard = RunGuard::acquire(&lock, stale).unwrap().unwrap();
    let outcome = run_once(&cfg, fetcher(&[("A", "v1")]), &store)
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Published { .. }));

    // Overlapping trigger cannot take the slot → no second pipeline run,
    // so no publish can race the one in flight.
    assert!(RunGuard::acquire(&lock, stale).unwrap().is_none());
    drop(guard);

    // The next holder baselines on what the first run published.
    let _guard = RunGuard::acquire(&lock, stale).unwrap().unwrap();
    let baseline = store.read_last().await.unwrap().unwrap();
    assert!(baseline.snapshot.get("A").unwrap().contains("v1"));
    let outcome = run_once(&cfg, fetcher(&[("A", "v1")]), &store)
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Clean);
}
