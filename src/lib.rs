// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod config;
pub mod detect;
pub mod fetch;
pub mod guard;
pub mod normalize;
pub mod pipeline;
pub mod publish;
pub mod snapshot;
pub mod telemetry;

// ---- Re-exports for stable public API ----
pub use crate::config::{Config, FeedSource};
pub use crate::detect::RunVerdict;
pub use crate::fetch::{FeedFetcher, FetchSettings, HttpFetcher, StaticFetcher};
pub use crate::guard::RunGuard;
pub use crate::pipeline::{run_once, RunOutcome};
pub use crate::publish::{GitStore, MemoryStore, SnapshotStore};
pub use crate::snapshot::{PersistedState, Snapshot};
