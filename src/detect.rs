// src/detect.rs
use crate::snapshot::Snapshot;

/// Detector output; scoped to one run, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunVerdict {
    Clean,
    Dirty,
}

/// Structural comparison against the last persisted snapshot. The normalizer
/// is deterministic, so equality here means no semantically meaningful change;
/// any difference in the canonical form is dirty. With no persisted state yet
/// (bootstrap) the verdict is unconditionally dirty.
pub fn detect(new: &Snapshot, previous: Option<&Snapshot>) -> RunVerdict {
    match previous {
        None => RunVerdict::Dirty,
        Some(prev) if prev == new => RunVerdict::Clean,
        Some(_) => RunVerdict::Dirty,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(pairs: &[(&str, &str)]) -> Snapshot {
        let mut s = Snapshot::default();
        for (id, doc) in pairs {
            s.insert(*id, *doc);
        }
        s
    }

    #[test]
    fn bootstrap_is_always_dirty() {
        assert_eq!(detect(&Snapshot::default(), None), RunVerdict::Dirty);
        assert_eq!(detect(&snap(&[("a", "v1")]), None), RunVerdict::Dirty);
    }

    #[test]
    fn identical_snapshots_are_clean() {
        let prev = snap(&[("a", "v1"), ("b", "v1")]);
        let new = snap(&[("a", "v1"), ("b", "v1")]);
        assert_eq!(detect(&new, Some(&prev)), RunVerdict::Clean);
    }

    #[test]
    fn any_byte_difference_is_dirty() {
        let prev = snap(&[("a", "v1"), ("b", "v1")]);
        assert_eq!(
            detect(&snap(&[("a", "v2"), ("b", "v1")]), Some(&prev)),
            RunVerdict::Dirty
        );
        // Added or removed source is a difference too.
        assert_eq!(
            detect(&snap(&[("a", "v1")]), Some(&prev)),
            RunVerdict::Dirty
        );
    }
}
