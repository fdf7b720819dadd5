//! The fast key/value store.
//!
//! An in-process, TTL-aware store with the primitives the kernel needs:
//! strings, hashes, sets, lists, counters, and a compare-and-set over a hash
//! field that runs under a single lock acquisition — the atomic step the FSM
//! advance relies on, the in-process equivalent of a server-side CAS script.
//!
//! Expired entries are dropped lazily on access and in bulk by the tempo
//! clock's sweep.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Values
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
enum StoreValue {
    Text(String),
    Counter(u64),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    List(Vec<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: StoreValue,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Compare-and-set failure: another writer got there first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CasConflict {
    /// The value actually present (None = field absent).
    pub current: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct FastStore {
    inner: Mutex<HashMap<String, Entry>>,
}

impl Default for FastStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FastStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    // ── Strings ─────────────────────────────────────────────────

    pub fn set_text(&self, key: &str, value: impl Into<String>, ttl: Option<Duration>) {
        let mut map = self.inner.lock();
        map.insert(
            key.to_owned(),
            Entry {
                value: StoreValue::Text(value.into()),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
    }

    pub fn get_text(&self, key: &str) -> Option<String> {
        let mut map = self.inner.lock();
        match live_entry(&mut map, key)?.value {
            StoreValue::Text(ref s) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, key: &str) -> bool {
        let mut map = self.inner.lock();
        live_entry(&mut map, key).is_some()
    }

    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    // ── Counters ────────────────────────────────────────────────

    /// Atomically increment a counter, creating it at 1.
    pub fn incr(&self, key: &str, ttl: Option<Duration>) -> u64 {
        let mut map = self.inner.lock();
        let now = Instant::now();
        let entry = map
            .entry(key.to_owned())
            .and_modify(|e| {
                if e.expired(now) {
                    e.value = StoreValue::Counter(0);
                    e.expires_at = ttl.map(|d| now + d);
                }
            })
            .or_insert_with(|| Entry {
                value: StoreValue::Counter(0),
                expires_at: ttl.map(|d| now + d),
            });
        match entry.value {
            StoreValue::Counter(ref mut n) => {
                *n += 1;
                *n
            }
            _ => {
                entry.value = StoreValue::Counter(1);
                1
            }
        }
    }

    // ── Hashes ──────────────────────────────────────────────────

    pub fn hash_set(&self, key: &str, field: &str, value: impl Into<String>) {
        let mut map = self.inner.lock();
        let entry = hash_entry(&mut map, key);
        if let StoreValue::Hash(ref mut fields) = entry.value {
            fields.insert(field.to_owned(), value.into());
        }
    }

    pub fn hash_get(&self, key: &str, field: &str) -> Option<String> {
        let mut map = self.inner.lock();
        match live_entry(&mut map, key)?.value {
            StoreValue::Hash(ref fields) => fields.get(field).cloned(),
            _ => None,
        }
    }

    pub fn hash_get_all(&self, key: &str) -> HashMap<String, String> {
        let mut map = self.inner.lock();
        match live_entry(&mut map, key).map(|e| &e.value) {
            Some(StoreValue::Hash(fields)) => fields.clone(),
            _ => HashMap::new(),
        }
    }

    pub fn hash_del(&self, key: &str, field: &str) -> bool {
        let mut map = self.inner.lock();
        match live_entry(&mut map, key).map(|e| &mut e.value) {
            Some(StoreValue::Hash(fields)) => fields.remove(field).is_some(),
            _ => false,
        }
    }

    /// Atomic compare-and-set over one hash field.
    ///
    /// `expected = None` means "field must be absent". The read-compare-write
    /// happens under one lock acquisition; concurrent callers serialize here.
    pub fn hash_compare_and_set(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        new_value: &str,
    ) -> Result<(), CasConflict> {
        let mut map = self.inner.lock();
        let entry = hash_entry(&mut map, key);
        let StoreValue::Hash(ref mut fields) = entry.value else {
            return Err(CasConflict { current: None });
        };
        let current = fields.get(field).cloned();
        if current.as_deref() == expected {
            fields.insert(field.to_owned(), new_value.to_owned());
            Ok(())
        } else {
            Err(CasConflict { current })
        }
    }

    // ── Sets ────────────────────────────────────────────────────

    pub fn set_add(&self, key: &str, member: impl Into<String>) -> bool {
        let mut map = self.inner.lock();
        let now = Instant::now();
        let entry = map
            .entry(key.to_owned())
            .and_modify(|e| {
                if e.expired(now) {
                    e.value = StoreValue::Set(HashSet::new());
                    e.expires_at = None;
                }
            })
            .or_insert_with(|| Entry {
                value: StoreValue::Set(HashSet::new()),
                expires_at: None,
            });
        match entry.value {
            StoreValue::Set(ref mut members) => members.insert(member.into()),
            _ => false,
        }
    }

    pub fn set_members(&self, key: &str) -> Vec<String> {
        let mut map = self.inner.lock();
        match live_entry(&mut map, key).map(|e| &e.value) {
            Some(StoreValue::Set(members)) => {
                let mut out: Vec<String> = members.iter().cloned().collect();
                out.sort();
                out
            }
            _ => Vec::new(),
        }
    }

    pub fn set_contains(&self, key: &str, member: &str) -> bool {
        let mut map = self.inner.lock();
        match live_entry(&mut map, key).map(|e| &e.value) {
            Some(StoreValue::Set(members)) => members.contains(member),
            _ => false,
        }
    }

    // ── Lists ───────────────────────────────────────────────────

    /// Append to a list; returns the new length.
    pub fn list_push(&self, key: &str, value: impl Into<String>) -> usize {
        let mut map = self.inner.lock();
        let now = Instant::now();
        let entry = map
            .entry(key.to_owned())
            .and_modify(|e| {
                if e.expired(now) {
                    e.value = StoreValue::List(Vec::new());
                    e.expires_at = None;
                }
            })
            .or_insert_with(|| Entry {
                value: StoreValue::List(Vec::new()),
                expires_at: None,
            });
        match entry.value {
            StoreValue::List(ref mut items) => {
                items.push(value.into());
                items.len()
            }
            _ => 0,
        }
    }

    /// Last `limit` entries, oldest first.
    pub fn list_tail(&self, key: &str, limit: usize) -> Vec<String> {
        let mut map = self.inner.lock();
        match live_entry(&mut map, key).map(|e| &e.value) {
            Some(StoreValue::List(items)) => {
                let start = items.len().saturating_sub(limit);
                items[start..].to_vec()
            }
            _ => Vec::new(),
        }
    }

    // ── TTL ─────────────────────────────────────────────────────

    /// Set the expiry. Returns false if the key does not exist.
    pub fn expire(&self, key: &str, ttl: Duration) -> bool {
        let mut map = self.inner.lock();
        match live_entry(&mut map, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        }
    }

    /// Extend the expiry to at least `now + ttl`, never shortening it.
    pub fn expire_at_least(&self, key: &str, ttl: Duration) -> bool {
        let mut map = self.inner.lock();
        match live_entry(&mut map, key) {
            Some(entry) => {
                let candidate = Instant::now() + ttl;
                entry.expires_at = match entry.expires_at {
                    Some(at) if at > candidate => Some(at),
                    _ => Some(candidate),
                };
                true
            }
            None => false,
        }
    }

    /// Keys under a prefix (used by the session TTL sweep).
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        let map = self.inner.lock();
        let mut out: Vec<String> = map
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        out.sort();
        out
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut map = self.inner.lock();
        let before = map.len();
        map.retain(|_, e| !e.expired(now));
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Fetch a live (non-expired) entry, dropping it if the TTL has lapsed.
fn live_entry<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let now = Instant::now();
    if map.get(key).is_some_and(|e| e.expired(now)) {
        map.remove(key);
        return None;
    }
    map.get_mut(key)
}

/// Fetch-or-create the hash entry for a key, resetting it if expired.
fn hash_entry<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> &'a mut Entry {
    let now = Instant::now();
    map.entry(key.to_owned())
        .and_modify(|e| {
            if e.expired(now) {
                e.value = StoreValue::Hash(HashMap::new());
                e.expires_at = None;
            }
        })
        .or_insert_with(|| Entry {
            value: StoreValue::Hash(HashMap::new()),
            expires_at: None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_set_get_delete() {
        let store = FastStore::new();
        store.set_text("k1", "v1", None);
        assert_eq!(store.get_text("k1").as_deref(), Some("v1"));
        assert!(store.delete("k1"));
        assert!(store.get_text("k1").is_none());
        assert!(!store.delete("k1"));
    }

    #[test]
    fn text_expires() {
        let store = FastStore::new();
        store.set_text("k1", "v1", Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(2));
        assert!(store.get_text("k1").is_none());
        assert!(!store.exists("k1"));
    }

    #[test]
    fn hash_fields() {
        let store = FastStore::new();
        store.hash_set("h", "a", "1");
        store.hash_set("h", "b", "2");
        assert_eq!(store.hash_get("h", "a").as_deref(), Some("1"));
        assert_eq!(store.hash_get_all("h").len(), 2);
        assert!(store.hash_del("h", "a"));
        assert!(store.hash_get("h", "a").is_none());
    }

    #[test]
    fn cas_succeeds_once() {
        let store = FastStore::new();
        // Field absent: expected=None succeeds, a second identical CAS fails.
        assert!(store
            .hash_compare_and_set("h", "state", None, "search")
            .is_ok());
        let err = store
            .hash_compare_and_set("h", "state", None, "search")
            .unwrap_err();
        assert_eq!(err.current.as_deref(), Some("search"));

        // Expected matches: advance; expected stale: conflict reports current.
        assert!(store
            .hash_compare_and_set("h", "state", Some("search"), "compare")
            .is_ok());
        let err = store
            .hash_compare_and_set("h", "state", Some("search"), "other")
            .unwrap_err();
        assert_eq!(err.current.as_deref(), Some("compare"));
    }

    #[test]
    fn cas_is_exclusive_across_threads() {
        use std::sync::Arc;
        let store = Arc::new(FastStore::new());
        store.hash_set("h", "state", "idle");

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                store
                    .hash_compare_and_set("h", "state", Some("idle"), &format!("won_{i}"))
                    .is_ok()
            }));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
    }

    #[test]
    fn sets_and_lists() {
        let store = FastStore::new();
        assert!(store.set_add("s", "a"));
        assert!(!store.set_add("s", "a"));
        store.set_add("s", "b");
        assert_eq!(store.set_members("s"), vec!["a", "b"]);
        assert!(store.set_contains("s", "b"));

        assert_eq!(store.list_push("l", "1"), 1);
        assert_eq!(store.list_push("l", "2"), 2);
        store.list_push("l", "3");
        assert_eq!(store.list_tail("l", 2), vec!["2", "3"]);
    }

    #[test]
    fn expire_at_least_never_shortens() {
        let store = FastStore::new();
        store.set_text("k", "v", Some(Duration::from_secs(3600)));
        store.expire_at_least("k", Duration::from_secs(1));
        // Still alive well past the shorter candidate.
        assert!(store.exists("k"));

        // Expired entries cannot be revived.
        store.set_text("k2", "v", Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(2));
        assert!(!store.expire_at_least("k2", Duration::from_secs(3600)));
        assert!(!store.exists("k2"));
    }

    #[test]
    fn incr_counts_up() {
        let store = FastStore::new();
        assert_eq!(store.incr("t", None), 1);
        assert_eq!(store.incr("t", None), 2);
        assert_eq!(store.incr("t", None), 3);
    }

    #[test]
    fn sweep_drops_expired() {
        let store = FastStore::new();
        store.set_text("a", "1", Some(Duration::from_millis(0)));
        store.set_text("b", "2", None);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(store.sweep_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn prefix_scan() {
        let store = FastStore::new();
        store.set_text("tempo:t1:session:a", "x", None);
        store.set_text("tempo:t1:session:b", "x", None);
        store.set_text("tempo:t2:session:c", "x", None);
        let keys = store.keys_with_prefix("tempo:t1:session:");
        assert_eq!(keys.len(), 2);
    }
}
