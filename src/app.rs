//! Composition root.
//!
//! `CoreRuntime` constructs the cache/lifecycle components once and wires
//! them together: platform events flow into the lifecycle monitor and the
//! cache manager's cold-restart heuristic, the host tick drives the
//! fail-open deadline and the watchdog scan, and recovery signals route
//! remediation back through the coordinator and cache manager. Hosts call
//! `tick` once per event-loop iteration and forward platform events as they
//! arrive; nothing here spawns timers of its own.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::cache::{CacheManager, CachePurge, SyncAgent};
use crate::config::CoreConfig;
use crate::init::{AuthState, InitCoordinator, InitPhase};
use crate::lifecycle::{LifecycleMonitor, PlatformEvent};
use crate::storage::KeyValueStore;
use crate::watchdog::{AnomalyWatchdog, RecoverySignal, StateSnapshot};

pub struct CoreRuntime {
    config: CoreConfig,
    lifecycle: Arc<LifecycleMonitor>,
    coordinator: Arc<InitCoordinator>,
    watchdog: Arc<AnomalyWatchdog>,
    cache_manager: Arc<CacheManager>,
}

impl CoreRuntime {
    /// Construct and wire the core. Consumes the manual-reload flag left by
    /// a previous session, running the full-reset path if present.
    pub fn new(
        config: CoreConfig,
        storage: Arc<dyn KeyValueStore>,
        sync_agent: Option<Arc<dyn SyncAgent>>,
    ) -> Self {
        let lifecycle = Arc::new(LifecycleMonitor::new(&config));
        let coordinator = Arc::new(InitCoordinator::new(&config));
        let watchdog = Arc::new(AnomalyWatchdog::new(&config));

        let mut cache_manager = CacheManager::new(storage, &config);
        if let Some(agent) = sync_agent {
            cache_manager = cache_manager.with_sync_agent(agent);
        }
        let cache_manager = Arc::new(cache_manager);

        let runtime = Self {
            config,
            lifecycle,
            coordinator,
            watchdog,
            cache_manager,
        };
        if runtime.cache_manager.check_pending_reload() {
            info!("Reload flag consumed at startup");
        }
        runtime
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleMonitor> {
        &self.lifecycle
    }

    pub fn coordinator(&self) -> &Arc<InitCoordinator> {
        &self.coordinator
    }

    pub fn watchdog(&self) -> &Arc<AnomalyWatchdog> {
        &self.watchdog
    }

    pub fn cache_manager(&self) -> &Arc<CacheManager> {
        &self.cache_manager
    }

    /// Register a cache namespace for bulk invalidation and recovery resets.
    pub fn register_store(&self, store: Arc<dyn CachePurge>) {
        self.cache_manager.register_store(store);
    }

    /// Subscribe to watchdog recovery signals.
    pub fn recovery_signals(&self) -> broadcast::Receiver<RecoverySignal> {
        self.watchdog.subscribe()
    }

    /// Host tick: observe the auth collaborator, apply the fail-open
    /// deadline, record a watchdog snapshot, and run the watchdog scan if
    /// due. Call once per host loop iteration.
    pub fn tick(&self, auth: AuthState) {
        self.tick_at(auth, Utc::now());
    }

    pub fn tick_at(&self, auth: AuthState, now: DateTime<Utc>) {
        self.coordinator.observe_auth_at(auth, now);
        let initialized = self.coordinator.phase_at(now) == InitPhase::Initialized;
        self.watchdog.record_snapshot(StateSnapshot {
            timestamp: now,
            loading: auth.loading,
            initialized,
            authenticated: auth.is_authenticated,
            approved: auth.is_approved,
            reason: "tick".to_string(),
        });
        self.watchdog.tick_at(now);
    }

    /// Forward a platform event to the lifecycle monitor and run the cache
    /// manager's hidden/visible bookkeeping on actual transitions.
    pub fn on_platform_event(&self, event: PlatformEvent) {
        self.on_platform_event_at(event, Utc::now());
    }

    pub fn on_platform_event_at(&self, event: PlatformEvent, now: DateTime<Utc>) {
        let was_visible = self.lifecycle.state().is_visible;
        self.lifecycle.handle_event_at(event, now);
        let is_visible = self.lifecycle.state().is_visible;

        if was_visible && !is_visible {
            self.cache_manager.note_hidden_at(now);
        } else if !was_visible && is_visible {
            let cold = self.cache_manager.note_visible_at(now);
            if cold {
                debug!("Cold restart fired on resume");
            }
        }
    }

    /// Remediation path for a recovery signal: reinitialize the coordinator
    /// and reset caches and preferences. Kept outside the watchdog so the
    /// detection policy stays purely observational.
    pub fn apply_recovery(&self, signal: &RecoverySignal) {
        info!(reason = %signal.reason, anomaly = ?signal.anomaly, "Applying recovery");
        self.coordinator.force_initialization();
        self.cache_manager.full_reset();
    }

    /// Tear down background work (consistency poll). Mandatory before
    /// dropping the runtime inside a live host.
    pub fn shutdown(&self) {
        self.lifecycle.shutdown();
    }
}
