//! Keyed registries for lazily created buckets and breakers.
//!
//! Lookups take the read lock only. Creating a key takes the single write
//! lock and re-checks for the key before constructing, so two racing callers
//! never build duplicate state.
//!
//! The registry is bounded. When an insert finds it full, one sweep drops
//! every idle entry that is [at rest](Reclaim::at_rest), then the least
//! recently touched at-rest entries until a small batch of slots is free.
//! An entry that is not at rest (a drained bucket, a tripped breaker) is only
//! dropped when nothing at rest is left, since recreating it would forget
//! its state.

use crate::clock::SharedClock;
use crate::telemetry::{KeyScope, SharedObserver, ThrottleEvent};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// State a registry may drop and later recreate.
pub trait Reclaim {
    /// True if a freshly created value would behave identically.
    fn at_rest(&self) -> bool;
}

#[derive(Debug)]
struct Entry<T> {
    value: Arc<T>,
    last_touched: AtomicU64,
}

/// Bounded map from key to shared state.
#[derive(Debug)]
pub struct KeyedRegistry<T> {
    scope: KeyScope,
    entries: RwLock<HashMap<String, Entry<T>>>,
    max_keys: usize,
    idle_ttl: Duration,
    clock: SharedClock,
    observer: SharedObserver,
}

impl<T: Reclaim> KeyedRegistry<T> {
    /// Create an empty registry. `max_keys` is clamped to at least one.
    pub fn new(
        scope: KeyScope,
        max_keys: usize,
        idle_ttl: Duration,
        clock: SharedClock,
        observer: SharedObserver,
    ) -> Self {
        Self {
            scope,
            entries: RwLock::new(HashMap::new()),
            max_keys: max_keys.max(1),
            idle_ttl,
            clock,
            observer,
        }
    }

    /// Fetch the value for `key`, creating it with `make` on first use.
    pub fn get_or_insert_with<F>(&self, key: &str, make: F) -> Arc<T>
    where
        F: FnOnce() -> T,
    {
        let now = self.now_nanos();
        {
            let map = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = map.get(key) {
                entry.last_touched.store(now, Ordering::Relaxed);
                return entry.value.clone();
            }
        }

        let (value, evicted) = {
            let mut map = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            // Another caller may have inserted between the two locks.
            if let Some(entry) = map.get(key) {
                entry.last_touched.store(now, Ordering::Relaxed);
                return entry.value.clone();
            }
            let evicted = if map.len() >= self.max_keys {
                self.evict(&mut map, now)
            } else {
                Vec::new()
            };
            let value = Arc::new(make());
            map.insert(
                key.to_string(),
                Entry { value: value.clone(), last_touched: AtomicU64::new(now) },
            );
            (value, evicted)
        };

        for key in evicted {
            tracing::debug!(target: "turnstile::registry", scope = %self.scope, key = %key, "evicted idle key");
            self.observer.observe(&ThrottleEvent::KeyEvicted { scope: self.scope, key });
        }
        value
    }

    /// Look up without creating or touching.
    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        let map = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        map.get(key).map(|entry| entry.value.clone())
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True if no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Map every entry through `f`, sorted by key. Does not touch entries.
    pub fn snapshot<R, F>(&self, f: F) -> BTreeMap<String, R>
    where
        F: Fn(&T) -> R,
    {
        let map = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        map.iter().map(|(key, entry)| (key.clone(), f(&entry.value))).collect()
    }

    fn evict(&self, map: &mut HashMap<String, Entry<T>>, now: u64) -> Vec<String> {
        let ttl = u64::try_from(self.idle_ttl.as_nanos()).unwrap_or(u64::MAX);
        let mut evicted = Vec::new();
        let mut busy = Vec::new();
        let mut resting = Vec::new();
        for (key, entry) in map.iter() {
            let touched = entry.last_touched.load(Ordering::Relaxed);
            if !entry.value.at_rest() {
                busy.push((touched, key.clone()));
            } else if now.saturating_sub(touched) >= ttl {
                evicted.push(key.clone());
            } else {
                resting.push((touched, key.clone()));
            }
        }

        let target = self.max_keys.saturating_sub(self.batch());
        let mut len = map.len() - evicted.len();
        resting.sort_unstable();
        for (_, key) in resting {
            if len <= target {
                break;
            }
            evicted.push(key);
            len -= 1;
        }
        if len >= self.max_keys {
            busy.sort_unstable();
            for (_, key) in busy {
                if len < self.max_keys {
                    break;
                }
                tracing::warn!(
                    target: "turnstile::registry",
                    scope = %self.scope,
                    key = %key,
                    "registry full of active keys; dropping state"
                );
                evicted.push(key);
                len -= 1;
            }
        }

        for key in &evicted {
            map.remove(key);
        }
        evicted
    }

    fn batch(&self) -> usize {
        (self.max_keys / 16).max(1)
    }

    fn now_nanos(&self) -> u64 {
        u64::try_from(self.clock.now().as_nanos()).unwrap_or(u64::MAX)
    }
}
