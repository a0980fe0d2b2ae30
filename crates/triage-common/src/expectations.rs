//! In-flight operation tracking for controllers that create or delete
//! objects they do not own.
//!
//! A controller records an expectation before issuing a create or delete
//! and observes it once a later authoritative read (or watch event)
//! proves the operation landed. Until the expectation is satisfied the
//! controller skips further writes for that key, so a slow cache cannot
//! provoke duplicate creates or deletes. Entries expire after a TTL so a
//! lost observation cannot wedge a key forever.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::warn;

/// How long an unsatisfied expectation blocks writes before it is
/// discarded as stale.
pub const DEFAULT_EXPECTATION_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
struct Expectation {
    adds: i64,
    deletes: HashSet<String>,
    recorded_at: Option<Instant>,
}

impl Expectation {
    fn satisfied(&self) -> bool {
        self.adds <= 0 && self.deletes.is_empty()
    }
}

/// Per-key expectation registry. Keys are `namespace/name` of the owning
/// record; deletes are tracked by UID so two machines with the same name
/// over time cannot satisfy each other's expectations.
#[derive(Debug)]
pub struct Expectations {
    inner: Mutex<HashMap<String, Expectation>>,
    ttl: Duration,
}

impl Default for Expectations {
    fn default() -> Self {
        Self::new()
    }
}

impl Expectations {
    /// Registry with the default TTL.
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_EXPECTATION_TTL)
    }

    /// Registry with a custom TTL.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn with_entry<R>(&self, key: &str, f: impl FnOnce(&mut Expectation) -> R) -> R {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = map.entry(key.to_string()).or_default();
        let result = f(entry);
        entry.recorded_at = Some(Instant::now());
        if entry.satisfied() {
            map.remove(key);
        }
        result
    }

    /// Record that one create for `key` is about to be issued.
    pub fn expect_add(&self, key: &str) {
        self.with_entry(key, |e| e.adds += 1);
    }

    /// Roll back an [`expect_add`](Self::expect_add) whose create failed.
    pub fn cancel_add(&self, key: &str) {
        self.with_entry(key, |e| e.adds = (e.adds - 1).max(0));
    }

    /// Record that a delete of the object with `uid` is about to be issued.
    pub fn expect_delete(&self, key: &str, uid: &str) {
        self.with_entry(key, |e| {
            e.deletes.insert(uid.to_string());
        });
    }

    /// Roll back an [`expect_delete`](Self::expect_delete) whose delete failed.
    pub fn cancel_delete(&self, key: &str, uid: &str) {
        self.with_entry(key, |e| {
            e.deletes.remove(uid);
        });
    }

    /// A create for `key` was confirmed: the object exists.
    pub fn observe_add(&self, key: &str) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = map.get_mut(key) {
            entry.adds = (entry.adds - 1).max(0);
            if entry.satisfied() {
                map.remove(key);
            }
        }
    }

    /// A delete of the object with `uid` was confirmed for `key`.
    pub fn observe_delete(&self, key: &str, uid: &str) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = map.get_mut(key) {
            entry.deletes.remove(uid);
            if entry.satisfied() {
                map.remove(key);
            }
        }
    }

    /// An authoritative read found the object for `key` alive with
    /// `live_uid`. Names are unique within a namespace, so every other
    /// recorded uid is proven gone.
    pub fn observe_deletes_except(&self, key: &str, live_uid: &str) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = map.get_mut(key) {
            entry.deletes.retain(|uid| uid == live_uid);
            if entry.satisfied() {
                map.remove(key);
            }
        }
    }

    /// An authoritative read found no object for `key`; every recorded
    /// delete is proven done.
    pub fn observe_all_deletes(&self, key: &str) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = map.get_mut(key) {
            entry.deletes.clear();
            if entry.satisfied() {
                map.remove(key);
            }
        }
    }

    /// Whether a delete of the object with `uid` is still pending for
    /// `key`. A fresh read that finds this uid alive means the promised
    /// delete has not landed and must be retried, not treated as a new
    /// object.
    pub fn pending_delete(&self, key: &str, uid: &str) -> bool {
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.get(key).is_some_and(|entry| entry.deletes.contains(uid))
    }

    /// Whether all recorded operations for `key` have been observed.
    /// Stale entries are swept and count as satisfied.
    pub fn satisfied(&self, key: &str) -> bool {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = map.get(key) else {
            return true;
        };
        if entry.satisfied() {
            map.remove(key);
            return true;
        }
        let stale = entry
            .recorded_at
            .map_or(true, |at| at.elapsed() >= self.ttl);
        if stale {
            warn!(key, "discarding stale expectation");
            map.remove(key);
            return true;
        }
        false
    }

    /// Drop all expectations for `key`, e.g. when the owning record goes away.
    pub fn clear(&self, key: &str) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.remove(key);
    }
}
