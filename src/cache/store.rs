//! Generic per-namespace key-value cache with TTL, scored eviction, and
//! stale-while-revalidate semantics.
//!
//! One `CacheStore` per logical data domain ("posts", "map_spots", ...).
//! Namespaces never share entries. All operations run synchronously to
//! completion; persistence is a best-effort JSON mirror into the durable
//! storage collaborator and never fails the caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::CacheTuning;
use crate::storage::{KeyValueStore, CACHE_PREFIX};

/// A single cached value with TTL and access bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub priority: u8,
    pub access_count: u64,
    pub last_accessed_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    fn new(data: T, ttl_ms: i64, priority: u8) -> Self {
        let now = Utc::now();
        Self {
            data,
            created_at: now,
            expires_at: now + Duration::milliseconds(ttl_ms),
            priority,
            access_count: 0,
            last_accessed_at: now,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    fn touch(&mut self) {
        self.access_count += 1;
        self.last_accessed_at = Utc::now();
    }
}

/// Per-namespace configuration.
#[derive(Debug, Clone)]
pub struct NamespaceConfig {
    pub name: String,
    pub max_size: usize,
    pub ttl_ms: i64,
    /// Bounded eviction priority for entries in this namespace
    pub priority: u8,
    /// Serve expired entries as stale hits instead of evicting on read
    pub stale_tolerant: bool,
}

impl NamespaceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_size: 100,
            ttl_ms: 5 * 60 * 1000,
            priority: 1,
            stale_tolerant: false,
        }
    }

    /// Capacity bound, clamped to at least one entry
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size.max(1);
        self
    }

    pub fn ttl_ms(mut self, ttl_ms: i64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn stale_tolerant(mut self, stale_tolerant: bool) -> Self {
        self.stale_tolerant = stale_tolerant;
        self
    }
}

/// Hit/miss counters surfaced per namespace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub stale_hits: u64,
    /// `hits / (hits + misses) * 100`; stale hits are neither
    pub hit_rate: f64,
}

/// Result of a cache lookup, distinguishing freshness for callers that
/// schedule background refreshes on stale data.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<T> {
    Fresh(T),
    Stale(T),
    Miss,
}

impl<T> CacheLookup<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            CacheLookup::Fresh(v) | CacheLookup::Stale(v) => Some(v),
            CacheLookup::Miss => None,
        }
    }
}

/// Per-namespace cache with TTL, scored eviction, and optional stale reads.
pub struct CacheStore<T> {
    config: NamespaceConfig,
    tuning: CacheTuning,
    entries: HashMap<String, CacheEntry<T>>,
    hits: u64,
    misses: u64,
    stale_hits: u64,
    storage: Option<Arc<dyn KeyValueStore>>,
}

impl<T> CacheStore<T>
where
    T: Clone + Serialize + DeserializeOwned,
{
    /// Create an in-memory-only store.
    pub fn new(config: NamespaceConfig, tuning: CacheTuning) -> Self {
        Self {
            config,
            tuning,
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
            stale_hits: 0,
            storage: None,
        }
    }

    /// Create a store mirrored into durable storage, loading any previously
    /// persisted entries. Load failures are logged and ignored.
    pub fn with_storage(
        config: NamespaceConfig,
        tuning: CacheTuning,
        storage: Arc<dyn KeyValueStore>,
    ) -> Self {
        let mut store = Self {
            config,
            tuning,
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
            stale_hits: 0,
            storage: Some(storage),
        };
        store.load_persisted();
        store
    }

    pub fn namespace(&self) -> &str {
        &self.config.name
    }

    fn storage_key(&self) -> String {
        format!("{}{}", CACHE_PREFIX, self.config.name)
    }

    /// Look up a key, classifying the result by freshness.
    ///
    /// Fresh entries count as hits. Expired entries in a stale-tolerant
    /// namespace are returned anyway as stale hits so callers can render
    /// something while a refresh happens; otherwise the expired entry is
    /// evicted and the lookup is a miss.
    pub fn lookup(&mut self, key: &str) -> CacheLookup<T> {
        let stale_tolerant = self.config.stale_tolerant;
        let found = match self.entries.get_mut(key) {
            Some(entry) if !entry.is_expired() => {
                entry.touch();
                Some(CacheLookup::Fresh(entry.data.clone()))
            }
            Some(entry) if stale_tolerant => {
                entry.touch();
                Some(CacheLookup::Stale(entry.data.clone()))
            }
            // Expired in a strict namespace: evict below, outside the borrow
            Some(_) => None,
            None => {
                self.misses += 1;
                return CacheLookup::Miss;
            }
        };
        match found {
            Some(CacheLookup::Fresh(data)) => {
                self.hits += 1;
                CacheLookup::Fresh(data)
            }
            Some(CacheLookup::Stale(data)) => {
                self.stale_hits += 1;
                CacheLookup::Stale(data)
            }
            _ => {
                self.entries.remove(key);
                self.misses += 1;
                self.persist();
                CacheLookup::Miss
            }
        }
    }

    /// Look up a key, returning the data for both fresh and stale hits.
    pub fn get(&mut self, key: &str) -> Option<T> {
        self.lookup(key).into_value()
    }

    /// Last-known value regardless of expiry, without touching counters.
    /// Used as the network-failure fallback.
    pub fn peek_any(&self, key: &str) -> Option<T> {
        self.entries.get(key).map(|e| e.data.clone())
    }

    /// Insert or overwrite a key, evicting one entry first if the namespace
    /// is full.
    pub fn set(&mut self, key: impl Into<String>, data: T) {
        let key = key.into();
        if !self.entries.contains_key(&key) && self.entries.len() >= self.config.max_size {
            self.evict_one();
        }
        let entry = CacheEntry::new(data, self.config.ttl_ms, self.config.priority);
        self.entries.insert(key, entry);
        self.persist();
    }

    pub fn remove(&mut self, key: &str) -> Option<T> {
        let removed = self.entries.remove(key).map(|e| e.data);
        if removed.is_some() {
            self.persist();
        }
        removed
    }

    /// Drop every entry. Idempotent; also clears the persisted mirror.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.persist();
    }

    /// True if the key exists and has not expired
    pub fn is_valid(&self, key: &str) -> bool {
        self.entries.get(key).map(|e| !e.is_expired()).unwrap_or(false)
    }

    /// True if the key exists but has expired
    pub fn is_stale(&self, key: &str) -> bool {
        self.entries.get(key).map(|e| e.is_expired()).unwrap_or(false)
    }

    /// Periodic sweep removing expired entries in non-stale-tolerant
    /// namespaces. Stale-tolerant namespaces keep expired entries for
    /// stale-while-revalidate reads. Returns the number removed.
    pub fn cleanup(&mut self) -> usize {
        if self.config.stale_tolerant {
            return 0;
        }
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired());
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(namespace = %self.config.name, removed, "Cache cleanup swept expired entries");
            self.persist();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let lookups = self.hits + self.misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64 * 100.0
        };
        CacheStats {
            size: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
            stale_hits: self.stale_hits,
            hit_rate,
        }
    }

    /// Evict the minimum-score entry.
    ///
    /// `score = priority * priority_weight - age_since_access / recency_scale
    /// + access_count`, favoring high-priority, recently and frequently used
    /// entries. Ties break toward the oldest `created_at`.
    fn evict_one(&mut self) {
        let now = Utc::now();
        let victim = self
            .entries
            .iter()
            .map(|(key, entry)| {
                let age_ms = (now - entry.last_accessed_at).num_milliseconds() as f64;
                let score = entry.priority as f64 * self.tuning.priority_weight
                    - age_ms / self.tuning.recency_scale_ms
                    + entry.access_count as f64;
                (key.clone(), score, entry.created_at)
            })
            .min_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.2.cmp(&b.2))
            })
            .map(|(key, _, _)| key);

        if let Some(key) = victim {
            debug!(namespace = %self.config.name, %key, "Evicting cache entry");
            self.entries.remove(&key);
        }
    }

    /// Mirror the namespace into durable storage as an ordered list of
    /// `[key, entry]` pairs. Failures are logged, never propagated.
    fn persist(&self) {
        let Some(ref storage) = self.storage else {
            return;
        };
        let mut pairs: Vec<(&String, &CacheEntry<T>)> = self.entries.iter().collect();
        pairs.sort_by(|a, b| a.1.created_at.cmp(&b.1.created_at));
        match serde_json::to_string(&pairs) {
            Ok(json) => {
                if let Err(e) = storage.set(&self.storage_key(), &json) {
                    warn!(namespace = %self.config.name, error = %e, "Failed to persist cache");
                }
            }
            Err(e) => {
                warn!(namespace = %self.config.name, error = %e, "Failed to serialize cache");
            }
        }
    }

    fn load_persisted(&mut self) {
        let Some(ref storage) = self.storage else {
            return;
        };
        let json = match storage.get(&self.storage_key()) {
            Ok(Some(json)) => json,
            Ok(None) => return,
            Err(e) => {
                warn!(namespace = %self.config.name, error = %e, "Failed to load persisted cache");
                return;
            }
        };
        match serde_json::from_str::<Vec<(String, CacheEntry<T>)>>(&json) {
            Ok(pairs) => {
                debug!(namespace = %self.config.name, count = pairs.len(), "Loaded persisted cache");
                self.entries = pairs.into_iter().collect();
            }
            Err(e) => {
                warn!(namespace = %self.config.name, error = %e, "Failed to parse persisted cache");
            }
        }
    }

    #[cfg(test)]
    fn entry_mut(&mut self, key: &str) -> Option<&mut CacheEntry<T>> {
        self.entries.get_mut(key)
    }
}

/// Namespace handle the administrative layer can purge without knowing the
/// entry type.
pub trait CachePurge: Send + Sync {
    fn namespace(&self) -> String;
    fn purge(&self);
}

/// The explicit, constructed-once cache instance shared by every consumer.
/// Clone is cheap; all clones see the same namespace.
pub struct SharedStore<T> {
    inner: Arc<Mutex<CacheStore<T>>>,
}

impl<T> Clone for SharedStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> SharedStore<T>
where
    T: Clone + Serialize + DeserializeOwned,
{
    pub fn new(store: CacheStore<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheStore<T>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn lookup(&self, key: &str) -> CacheLookup<T> {
        self.lock().lookup(key)
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.lock().get(key)
    }

    pub fn peek_any(&self, key: &str) -> Option<T> {
        self.lock().peek_any(key)
    }

    pub fn set(&self, key: impl Into<String>, data: T) {
        self.lock().set(key, data)
    }

    pub fn remove(&self, key: &str) -> Option<T> {
        self.lock().remove(key)
    }

    pub fn clear(&self) {
        self.lock().clear()
    }

    pub fn is_valid(&self, key: &str) -> bool {
        self.lock().is_valid(key)
    }

    pub fn is_stale(&self, key: &str) -> bool {
        self.lock().is_stale(key)
    }

    pub fn cleanup(&self) -> usize {
        self.lock().cleanup()
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl<T> CachePurge for SharedStore<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    fn namespace(&self) -> String {
        self.lock().namespace().to_string()
    }

    fn purge(&self) {
        self.lock().clear()
    }
}
