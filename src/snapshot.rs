// src/snapshot.rs
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Canonical representation of all sources' content at one instant.
/// BTreeMap keeps the source order fixed, so equality is structural and a
/// byte-level digest is stable across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    docs: BTreeMap<String, String>,
}

impl Snapshot {
    pub fn insert(&mut self, id: impl Into<String>, doc: impl Into<String>) {
        self.docs.insert(id.into(), doc.into());
    }

    pub fn get(&self, id: &str) -> Option<&str> {
        self.docs.get(id).map(String::as_str)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.docs.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.docs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Hex sha256 over the length-framed (id, doc) sequence. Framing keeps
    /// ("ab","c") and ("a","bc") from colliding.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (id, doc) in &self.docs {
            hasher.update((id.len() as u64).to_be_bytes());
            hasher.update(id.as_bytes());
            hasher.update((doc.len() as u64).to_be_bytes());
            hasher.update(doc.as_bytes());
        }
        hex(&hasher.finalize())
    }

    /// Short digest prefix for log lines and commit messages.
    pub fn short_digest(&self) -> String {
        let mut d = self.digest();
        d.truncate(12);
        d
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// The single snapshot currently recorded in the store, plus its commit id.
#[derive(Debug, Clone)]
pub struct PersistedState {
    pub snapshot: Snapshot,
    pub commit: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic_and_order_independent() {
        let mut a = Snapshot::default();
        a.insert("b", "2");
        a.insert("a", "1");

        let mut b = Snapshot::default();
        b.insert("a", "1");
        b.insert("b", "2");

        assert_eq!(a, b);
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest(), a.digest());
    }

    #[test]
    fn digest_framing_avoids_concat_collisions() {
        let mut a = Snapshot::default();
        a.insert("ab", "c");
        let mut b = Snapshot::default();
        b.insert("a", "bc");
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn short_digest_is_prefix() {
        let mut s = Snapshot::default();
        s.insert("x", "y");
        assert!(s.digest().starts_with(&s.short_digest()));
        assert_eq!(s.short_digest().len(), 12);
    }
}
