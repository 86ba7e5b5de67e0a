//! The common cache contract: every cache is bounded by a hard size and a
//! warn size, evicts LRU beyond hard size, and exposes
//! `get`/`add`/`remove`/`len`/`remove_expired`/`checkpoint`/`restore`.

pub mod assertion;
pub mod capabilities;
pub mod connection;
pub mod negative_assertion;
pub mod pending_key;
pub mod pending_query;
pub mod zone_key;

use std::collections::HashMap;
use std::hash::Hash;

/// A bounded, LRU-evicting map shared by most of the specific caches.
///
/// Keyed on `std::collections::HashMap` (SipHash) rather than the daemon's
/// usual `foldhash`: cache keys here are drawn from attacker-controlled
/// wire content (zone names, subject names, tokens), and `foldhash` is
/// documented upstream as unsuitable once untrusted input picks the keys.
pub struct BoundedCache<K, V> {
    entries: HashMap<K, Slot<V>>,
    hard_size: usize,
    warn_size: usize,
    clock: u64,
}

struct Slot<V> {
    value: V,
    last_used: u64,
    valid_until: Option<i64>,
}

/// Whether the cache crossed its warn size as a result of the last `add`.
/// Callers log a telemetry warning when this is `true`.
pub struct AddOutcome {
    pub evicted: usize,
    pub over_warn_size: bool,
}

impl<K: Eq + Hash + Clone, V> BoundedCache<K, V> {
    pub fn new(hard_size: usize, warn_size: usize) -> Self {
        BoundedCache {
            entries: HashMap::new(),
            hard_size,
            warn_size,
            clock: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.clock += 1;
        let clock = self.clock;
        let slot = self.entries.get_mut(key)?;
        slot.last_used = clock;
        Some(&slot.value)
    }

    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|slot| &slot.value)
    }

    /// Insert or replace `key`, then evict least-recently-used entries
    /// until at or under `hard_size`.
    pub fn add(&mut self, key: K, value: V, valid_until: Option<i64>) -> AddOutcome {
        self.clock += 1;
        self.entries.insert(
            key,
            Slot {
                value,
                last_used: self.clock,
                valid_until,
            },
        );

        let mut evicted = 0;
        while self.entries.len() > self.hard_size {
            let lru_key = self
                .entries
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(k, _)| k.clone());
            let Some(lru_key) = lru_key else { break };
            self.entries.remove(&lru_key);
            evicted += 1;
        }

        AddOutcome {
            evicted,
            over_warn_size: self.entries.len() >= self.warn_size,
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|slot| slot.value)
    }

    /// Drop every entry whose `valid_until` has passed `now`. Entries with
    /// no expiry (`valid_until: None`) are never reaped this way.
    pub fn remove_expired(&mut self, now: i64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, slot| slot.valid_until.is_none_or(|until| until > now));
        before - self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(k, slot)| (k, &slot.value))
    }

    /// Like [`Self::iter`], but also yields each entry's expiry. Used by
    /// `checkpoint()` implementations, which need to persist expiry
    /// alongside content rather than let a restored entry live forever.
    pub fn iter_with_expiry(&self) -> impl Iterator<Item = (&K, &V, Option<i64>)> {
        self.entries
            .iter()
            .map(|(k, slot)| (k, &slot.value, slot.valid_until))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_the_least_recently_used_entry_past_hard_size() {
        let mut cache: BoundedCache<&'static str, u32> = BoundedCache::new(2, 2);
        cache.add("a", 1, None);
        cache.add("b", 2, None);
        cache.get(&"a");
        cache.add("c", 3, None);

        assert_eq!(cache.len(), 2);
        assert!(cache.peek(&"a").is_some());
        assert!(cache.peek(&"c").is_some());
        assert!(cache.peek(&"b").is_none());
    }

    #[test]
    fn remove_expired_drops_only_past_entries() {
        let mut cache: BoundedCache<&'static str, u32> = BoundedCache::new(10, 10);
        cache.add("a", 1, Some(100));
        cache.add("b", 2, Some(200));
        cache.add("c", 3, None);

        let reaped = cache.remove_expired(150);
        assert_eq!(reaped, 1);
        assert!(cache.peek(&"a").is_none());
        assert!(cache.peek(&"b").is_some());
        assert!(cache.peek(&"c").is_some());
    }
}
