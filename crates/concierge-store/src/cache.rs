//! Process-local caches in front of the session table.
//!
//! A TTL cache (phone+clinic+channel → session id) plus a per-key in-flight
//! lock so concurrent first contact from the same user performs one
//! database upsert, not several. Both may diverge briefly across replicas —
//! correctness never depends on cross-process consistency.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;

/// Cache key for a conversation slot.
pub fn slot_key(phone: &str, clinic_id: &str, channel: &str) -> String {
    format!("{phone}:{clinic_id}:{channel}")
}

#[derive(Clone)]
struct Entry {
    session_id: String,
    inserted_at: Instant,
}

/// TTL map of conversation slot → session id.
pub struct SessionCache {
    entries: DashMap<String, Entry>,
    ttl: Duration,
}

impl SessionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let entry = self.entries.get(key)?;
        if entry.inserted_at.elapsed() > self.ttl {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.session_id.clone())
    }

    pub fn put(&self, key: &str, session_id: &str) {
        self.entries.insert(
            key.to_string(),
            Entry {
                session_id: session_id.to_string(),
                inserted_at: Instant::now(),
            },
        );
    }

    /// Invalidate on write — a session that just ended must not be served
    /// from cache.
    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-key async locks deduplicating concurrent get-or-create calls.
///
/// The lock entry is dropped once no caller holds it; the map never grows
/// beyond the number of concurrently-active slots.
#[derive(Default)]
pub struct InflightLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl InflightLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Remove the entry if nobody else holds a clone.
    pub fn release(&self, key: &str) {
        if let Some(entry) = self.locks.get(key) {
            // 2 = the map's copy + ours.
            if Arc::strong_count(entry.value()) <= 2 {
                drop(entry);
                self.locks.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_expires_after_ttl() {
        let cache = SessionCache::new(Duration::from_millis(0));
        cache.put("k", "s1");
        // Zero TTL: the entry is already stale.
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn cache_hit_within_ttl() {
        let cache = SessionCache::new(Duration::from_secs(60));
        cache.put("k", "s1");
        assert_eq!(cache.get("k").as_deref(), Some("s1"));
        cache.invalidate("k");
        assert_eq!(cache.get("k"), None);
    }

    #[tokio::test]
    async fn inflight_lock_serializes_same_key() {
        let locks = InflightLocks::new();
        let l1 = locks.lock_for("k");
        let guard = l1.lock().await;
        let l2 = locks.lock_for("k");
        assert!(l2.try_lock().is_err());
        drop(guard);
        assert!(l2.try_lock().is_ok());
        locks.release("k");
    }
}
