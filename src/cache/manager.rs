//! Administrative cache layer.
//!
//! Bulk and prefix invalidation across every registered namespace, app
//! preference reset, the cold-restart heuristic driven by elapsed background
//! time, and the manual-reload detector. All storage work is best-effort;
//! the optional background sync agent receives one-way notifications and its
//! absence degrades gracefully.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::cache::store::CachePurge;
use crate::config::CoreConfig;
use crate::storage::{KeyValueStore, CACHE_PREFIX, PREF_PREFIX};

/// Storage key holding the last transition-to-hidden timestamp
const HIDDEN_AT_KEY: &str = "lifecycle:hidden_at";

/// Storage key flagging a manual reload in progress
const RELOAD_FLAG_KEY: &str = "lifecycle:reload_pending";

/// One-way commands accepted by the background sync agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCommand {
    ClearCache,
    ClearApiCache,
    AppFocus,
    AppRestart,
}

/// Optional out-of-process cache collaborator (e.g. a background sync
/// agent). Notifications are fire-and-forget.
pub trait SyncAgent: Send + Sync {
    fn notify(&self, command: SyncCommand);
}

pub struct CacheManager {
    storage: Arc<dyn KeyValueStore>,
    sync_agent: Option<Arc<dyn SyncAgent>>,
    stores: Mutex<Vec<Arc<dyn CachePurge>>>,
    cold_restart_threshold_ms: i64,
}

impl CacheManager {
    pub fn new(storage: Arc<dyn KeyValueStore>, config: &CoreConfig) -> Self {
        Self {
            storage,
            sync_agent: None,
            stores: Mutex::new(Vec::new()),
            cold_restart_threshold_ms: config.profile().cold_restart_threshold_ms,
        }
    }

    pub fn with_sync_agent(mut self, agent: Arc<dyn SyncAgent>) -> Self {
        self.sync_agent = Some(agent);
        self
    }

    /// Register a namespace for bulk/prefix invalidation.
    pub fn register_store(&self, store: Arc<dyn CachePurge>) {
        let mut stores = self.stores.lock().unwrap_or_else(|p| p.into_inner());
        stores.push(store);
    }

    fn notify_agent(&self, command: SyncCommand) {
        if let Some(ref agent) = self.sync_agent {
            agent.notify(command);
        }
    }

    fn remove_keys_with_prefix(&self, prefix: &str) {
        let keys = match self.storage.keys() {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Failed to enumerate storage keys");
                return;
            }
        };
        for key in keys.iter().filter(|k| k.starts_with(prefix)) {
            if let Err(e) = self.storage.remove(key) {
                warn!(%key, error = %e, "Failed to remove storage key");
            }
        }
    }

    /// Purge every registered namespace and every persisted cache mirror,
    /// and tell the sync agent to do the same.
    pub fn clear_all_cache(&self) {
        info!("Clearing all caches");
        let stores = self.stores.lock().unwrap_or_else(|p| p.into_inner());
        for store in stores.iter() {
            store.purge();
        }
        drop(stores);
        self.remove_keys_with_prefix(CACHE_PREFIX);
        self.notify_agent(SyncCommand::ClearCache);
        self.notify_agent(SyncCommand::ClearApiCache);
    }

    /// Purge namespaces whose name starts with `prefix`, plus their
    /// persisted mirrors.
    pub fn clear_cache_by_prefix(&self, prefix: &str) {
        debug!(prefix, "Clearing caches by prefix");
        let stores = self.stores.lock().unwrap_or_else(|p| p.into_inner());
        for store in stores.iter().filter(|s| s.namespace().starts_with(prefix)) {
            store.purge();
        }
        drop(stores);
        self.remove_keys_with_prefix(&format!("{}{}", CACHE_PREFIX, prefix));
    }

    /// Clear UI/navigation preference keys, distinct from data caches.
    pub fn reset_app_state(&self) {
        debug!("Resetting app preference state");
        self.remove_keys_with_prefix(PREF_PREFIX);
    }

    pub fn full_reset(&self) {
        self.clear_all_cache();
        self.reset_app_state();
    }

    /// Persist the hidden-at timestamp for the cold-restart heuristic.
    pub fn note_hidden(&self) {
        self.note_hidden_at(Utc::now());
    }

    pub fn note_hidden_at(&self, now: DateTime<Utc>) {
        if let Err(e) = self.storage.set(HIDDEN_AT_KEY, &now.to_rfc3339()) {
            warn!(error = %e, "Failed to persist hidden-at timestamp");
        }
    }

    /// Apply the cold-restart heuristic on return to foreground. If the
    /// elapsed hidden duration exceeds the device-class threshold the
    /// resumption counts as a cold restart and a full reset runs; otherwise
    /// caches stay untouched. Returns whether a cold restart fired.
    pub fn note_visible(&self) -> bool {
        self.note_visible_at(Utc::now())
    }

    pub fn note_visible_at(&self, now: DateTime<Utc>) -> bool {
        let hidden_at = match self.storage.get(HIDDEN_AT_KEY) {
            Ok(Some(raw)) => DateTime::parse_from_rfc3339(&raw)
                .map(|dt| dt.with_timezone(&Utc))
                .ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Failed to read hidden-at timestamp");
                None
            }
        };
        if let Err(e) = self.storage.remove(HIDDEN_AT_KEY) {
            warn!(error = %e, "Failed to clear hidden-at timestamp");
        }

        let Some(hidden_at) = hidden_at else {
            self.notify_agent(SyncCommand::AppFocus);
            return false;
        };

        let elapsed = now - hidden_at;
        if elapsed > Duration::milliseconds(self.cold_restart_threshold_ms) {
            info!(
                elapsed_ms = elapsed.num_milliseconds(),
                threshold_ms = self.cold_restart_threshold_ms,
                "Long background detected, treating resumption as cold restart"
            );
            self.full_reset();
            self.notify_agent(SyncCommand::AppRestart);
            true
        } else {
            self.notify_agent(SyncCommand::AppFocus);
            false
        }
    }

    /// Set immediately before an intentional unload/reload.
    pub fn mark_reload_pending(&self) {
        if let Err(e) = self.storage.set(RELOAD_FLAG_KEY, "1") {
            warn!(error = %e, "Failed to set reload flag");
        }
    }

    /// Consume the manual-reload flag on startup; a present flag triggers
    /// the same full-reset path as a cold restart. Returns whether it fired.
    pub fn check_pending_reload(&self) -> bool {
        let pending = matches!(self.storage.get(RELOAD_FLAG_KEY), Ok(Some(_)));
        if !pending {
            return false;
        }
        if let Err(e) = self.storage.remove(RELOAD_FLAG_KEY) {
            warn!(error = %e, "Failed to clear reload flag");
        }
        info!("Manual reload detected, running full reset");
        self.full_reset();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::{CacheStore, NamespaceConfig, SharedStore};
    use crate::config::{CacheTuning, DeviceClass};
    use crate::storage::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingAgent {
        commands: Mutex<Vec<SyncCommand>>,
    }

    impl RecordingAgent {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                commands: Mutex::new(Vec::new()),
            })
        }

        fn commands(&self) -> Vec<SyncCommand> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl SyncAgent for RecordingAgent {
        fn notify(&self, command: SyncCommand) {
            self.commands.lock().unwrap().push(command);
        }
    }

    fn shared_store(name: &str) -> SharedStore<Vec<i64>> {
        SharedStore::new(CacheStore::new(
            NamespaceConfig::new(name),
            CacheTuning::default(),
        ))
    }

    fn manager(storage: Arc<dyn KeyValueStore>) -> CacheManager {
        CacheManager::new(storage, &CoreConfig::default())
    }

    #[test]
    fn test_clear_all_cache_purges_stores_and_mirrors() {
        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        storage.set("cache:posts", "[]").unwrap();
        storage.set("pref:tab", "map").unwrap();

        let mgr = manager(Arc::clone(&storage));
        let posts = shared_store("posts");
        posts.set("posts_all", vec![1]);
        mgr.register_store(Arc::new(posts.clone()));

        mgr.clear_all_cache();

        assert!(posts.is_empty());
        assert_eq!(storage.get("cache:posts").unwrap(), None);
        // Preferences are not data caches
        assert!(storage.get("pref:tab").unwrap().is_some());
    }

    #[test]
    fn test_clear_cache_by_prefix() {
        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        storage.set("cache:map_spots", "[]").unwrap();
        storage.set("cache:posts", "[]").unwrap();

        let mgr = manager(Arc::clone(&storage));
        let spots = shared_store("map_spots");
        let posts = shared_store("posts");
        spots.set("all", vec![1]);
        posts.set("all", vec![2]);
        mgr.register_store(Arc::new(spots.clone()));
        mgr.register_store(Arc::new(posts.clone()));

        mgr.clear_cache_by_prefix("map");

        assert!(spots.is_empty());
        assert!(!posts.is_empty());
        assert_eq!(storage.get("cache:map_spots").unwrap(), None);
        assert!(storage.get("cache:posts").unwrap().is_some());
    }

    #[test]
    fn test_reset_app_state_only_touches_prefs() {
        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        storage.set("pref:tab", "map").unwrap();
        storage.set("cache:posts", "[]").unwrap();

        manager(Arc::clone(&storage)).reset_app_state();

        assert_eq!(storage.get("pref:tab").unwrap(), None);
        assert!(storage.get("cache:posts").unwrap().is_some());
    }

    #[test]
    fn test_cold_restart_after_long_background() {
        // Scenario D: hidden past the threshold forces a full reset on the
        // next visible transition
        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let agent = RecordingAgent::new();
        let config = CoreConfig {
            device_class: DeviceClass::Constrained,
            ..CoreConfig::default()
        };
        let mgr = CacheManager::new(Arc::clone(&storage), &config)
            .with_sync_agent(agent.clone() as Arc<dyn SyncAgent>);

        let posts = shared_store("posts");
        posts.set("all", vec![1]);
        mgr.register_store(Arc::new(posts.clone()));

        let t0 = Utc::now();
        mgr.note_hidden_at(t0);

        // 16 minutes exceeds the constrained 15-minute threshold
        let fired = mgr.note_visible_at(t0 + Duration::minutes(16));
        assert!(fired);
        assert!(posts.is_empty());
        assert!(agent.commands().contains(&SyncCommand::AppRestart));
    }

    #[test]
    fn test_short_background_preserves_caches() {
        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let agent = RecordingAgent::new();
        let config = CoreConfig {
            device_class: DeviceClass::Constrained,
            ..CoreConfig::default()
        };
        let mgr = CacheManager::new(Arc::clone(&storage), &config)
            .with_sync_agent(agent.clone() as Arc<dyn SyncAgent>);

        let posts = shared_store("posts");
        posts.set("all", vec![1]);
        mgr.register_store(Arc::new(posts.clone()));

        let t0 = Utc::now();
        mgr.note_hidden_at(t0);
        let fired = mgr.note_visible_at(t0 + Duration::minutes(2));

        assert!(!fired);
        assert!(!posts.is_empty());
        assert_eq!(agent.commands(), vec![SyncCommand::AppFocus]);
    }

    #[test]
    fn test_visible_without_hidden_timestamp() {
        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mgr = manager(storage);
        assert!(!mgr.note_visible());
    }

    #[test]
    fn test_manual_reload_flag() {
        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mgr = manager(Arc::clone(&storage));
        let posts = shared_store("posts");
        posts.set("all", vec![1]);
        mgr.register_store(Arc::new(posts.clone()));

        assert!(!mgr.check_pending_reload());

        mgr.mark_reload_pending();
        assert!(mgr.check_pending_reload());
        assert!(posts.is_empty());

        // Flag is consumed
        assert!(!mgr.check_pending_reload());
    }

    #[test]
    fn test_missing_sync_agent_degrades_gracefully() {
        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mgr = manager(storage);
        // No agent registered; notifications are simply dropped
        mgr.clear_all_cache();
        mgr.note_visible();
    }

    #[test]
    fn test_purge_counts_once_per_registered_store() {
        struct CountingPurge(AtomicUsize);
        impl CachePurge for CountingPurge {
            fn namespace(&self) -> String {
                "counted".to_string()
            }
            fn purge(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mgr = manager(storage);
        let counter = Arc::new(CountingPurge(AtomicUsize::new(0)));
        mgr.register_store(counter.clone());

        mgr.full_reset();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
