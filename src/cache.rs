//! Bounded LRU cache.
//!
//! Used by page detection to avoid re-running geometry analysis across
//! repeated pipeline invocations, and exported for upstream callers that
//! need the same eviction discipline.
//!
//! Key properties:
//! - `len()` never exceeds the configured capacity
//! - `get` marks an entry most-recently-used
//! - `set` on a full cache evicts the least-recently-used entry first

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

/// Default capacity used when a caller does not choose one.
pub const DEFAULT_CACHE_CAPACITY: usize = 50;

// ═══════════════════════════════════════════════════════════
// CacheEntry
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    /// Recency marker. Higher is more recent.
    tick: u64,
}

// ═══════════════════════════════════════════════════════════
// BoundedCache: single-owner LRU
// ═══════════════════════════════════════════════════════════

/// Fixed-capacity key/value store with least-recently-used eviction.
///
/// Recency is tracked with a monotonically increasing tick; `order` maps
/// tick -> key so the oldest entry is always the first in the tree.
#[derive(Debug)]
pub struct BoundedCache<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    order: BTreeMap<u64, K>,
    max_size: usize,
    next_tick: u64,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create a cache holding at most `max_size` entries.
    /// A capacity of zero is raised to one.
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            entries: HashMap::with_capacity(max_size),
            order: BTreeMap::new(),
            max_size,
            next_tick: 0,
        }
    }

    /// Look up a key, marking it most-recently-used on hit.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let tick = self.bump();
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.tick);
        entry.tick = tick;
        self.order.insert(tick, key.clone());
        Some(&entry.value)
    }

    /// Look up a key without touching its recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|e| &e.value)
    }

    /// Insert or update a value. Returns the evicted key, if any.
    pub fn set(&mut self, key: K, value: V) -> Option<K> {
        let tick = self.bump();

        if let Some(entry) = self.entries.get_mut(&key) {
            self.order.remove(&entry.tick);
            entry.tick = tick;
            entry.value = value;
            self.order.insert(tick, key);
            return None;
        }

        let evicted = if self.entries.len() >= self.max_size {
            self.evict_oldest()
        } else {
            None
        };

        self.order.insert(tick, key.clone());
        self.entries.insert(key, CacheEntry { value, tick });
        evicted
    }

    /// Remove a key, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        Some(entry.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn evict_oldest(&mut self) -> Option<K> {
        let (_, key) = self.order.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }

    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }
}

// ═══════════════════════════════════════════════════════════
// SharedCache: mutex-guarded LRU for concurrent callers
// ═══════════════════════════════════════════════════════════

/// Thread-safe wrapper around [`BoundedCache`].
///
/// Every operation takes the lock for its whole duration, so recency
/// updates and evictions are never lost between concurrent callers.
#[derive(Debug)]
pub struct SharedCache<K, V> {
    inner: Mutex<BoundedCache<K, V>>,
}

impl<K, V> SharedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(BoundedCache::new(max_size)),
        }
    }

    /// Clone out a cached value, marking it most-recently-used.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut cache = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let hit = cache.get(key).cloned();
        if hit.is_some() {
            tracing::trace!("Cache hit");
        }
        hit
    }

    pub fn set(&self, key: K, value: V) -> Option<K> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn capacity(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .capacity()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl<K, V> Default for SharedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
