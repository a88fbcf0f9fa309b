//! Local caching module.
//!
//! This module provides the per-namespace `CacheStore` (TTL, scored
//! eviction, stale-while-revalidate, hit/miss statistics) and the
//! administrative `CacheManager` (bulk invalidation, preference reset,
//! cold-restart heuristic).
//!
//! Namespaces map one-to-one to logical data domains ("posts", "map_spots",
//! "inbox") and never share entries.

pub mod manager;
pub mod store;

pub use manager::{CacheManager, SyncAgent, SyncCommand};
pub use store::{
    CacheEntry, CacheLookup, CachePurge, CacheStats, CacheStore, NamespaceConfig, SharedStore,
};
