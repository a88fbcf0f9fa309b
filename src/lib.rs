//! Spotcache - client-side cache and lifecycle coordination core.
//!
//! The data layer of a social/content client (posts, map spots, inbox):
//! TTL/LRU caching of remote-fetched collections with stale-while-revalidate
//! reads, foreground/background lifecycle tracking with refresh heuristics,
//! a fail-open initialization state machine that never blocks the UI
//! indefinitely, and a watchdog that detects stuck or contradictory states
//! and broadcasts recovery signals.
//!
//! Components are constructed once at a composition root ([`CoreRuntime`])
//! and injected into consumers; domain data hooks are instances of
//! [`DataAccessAdapter`] over a shared cache namespace.

pub mod adapter;
pub mod app;
pub mod cache;
pub mod config;
pub mod error;
pub mod init;
pub mod lifecycle;
pub mod remote;
pub mod storage;
pub mod watchdog;

pub use adapter::{DataAccessAdapter, Normalizer};
pub use app::CoreRuntime;
pub use cache::{
    CacheEntry, CacheLookup, CacheManager, CachePurge, CacheStats, CacheStore, NamespaceConfig,
    SharedStore, SyncAgent, SyncCommand,
};
pub use config::{CacheTuning, CoreConfig, DeviceClass, DeviceProfile};
pub use error::FetchError;
pub use init::{AuthState, InitCoordinator, InitPhase};
pub use lifecycle::{
    LifecycleMonitor, LifecycleSignal, PlatformEvent, UsagePattern, VisibilityState,
};
pub use remote::{normalize_records, FetchFn, RecordFilter, RemoteClient};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use watchdog::{AnomalyKind, AnomalyReport, AnomalyWatchdog, RecoverySignal, StateSnapshot};
