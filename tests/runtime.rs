//! End-to-end exercise of the wired core: adapter fetches through a shared
//! cache namespace, lifecycle transitions drive the cold-restart heuristic,
//! and a stuck initialization recovers through the watchdog path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::FutureExt;
use serde_json::{json, Value};
use spotcache::{
    AnomalyKind, AuthState, CacheStore, CacheTuning, CoreConfig, CoreRuntime, DataAccessAdapter,
    DeviceClass, FetchFn, LifecycleMonitor, MemoryStore, NamespaceConfig, PlatformEvent,
    RecordFilter, SharedStore,
};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

fn spot_fetch(calls: Arc<AtomicUsize>) -> FetchFn<Value> {
    Arc::new(move |_filter: RecordFilter| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            Ok(vec![
                json!({"id": 2, "name": "ramen bar", "created_at": "2026-08-20T00:00:00Z"}),
                json!({"id": 1, "name": "old diner", "created_at": "2026-08-01T00:00:00Z"}),
            ])
        }
        .boxed()
    })
}

#[tokio::test]
async fn adapter_and_runtime_share_one_cache() {
    init_tracing();

    let config = CoreConfig {
        device_class: DeviceClass::Constrained,
        ..CoreConfig::default()
    };
    let storage = Arc::new(MemoryStore::new());
    let runtime = CoreRuntime::new(config.clone(), storage, None);

    let spots = SharedStore::new(CacheStore::new(
        NamespaceConfig::new("map_spots").stale_tolerant(true),
        CacheTuning::default(),
    ));
    runtime.register_store(Arc::new(spots.clone()));

    let calls = Arc::new(AtomicUsize::new(0));
    let adapter = DataAccessAdapter::new(
        spots.clone(),
        Arc::new(LifecycleMonitor::new(&config)),
        RecordFilter::new("map_spots"),
        spot_fetch(calls.clone()),
        &config,
    );

    // First fetch goes remote, second is a pure cache hit
    let records = adapter.fetch(false).await.unwrap();
    assert_eq!(records.len(), 2);
    let records = adapter.fetch(false).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A long background period wipes the namespace through the cold-restart
    // heuristic; the next fetch goes remote again
    let t0 = Utc::now();
    runtime.on_platform_event_at(PlatformEvent::VisibilityChanged(false), t0);
    runtime.on_platform_event_at(
        PlatformEvent::VisibilityChanged(true),
        t0 + Duration::minutes(20),
    );
    assert!(spots.is_empty());

    adapter.fetch(false).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    adapter.shutdown();
    runtime.shutdown();
}

#[tokio::test]
async fn stuck_initialization_recovers_via_watchdog() {
    init_tracing();

    let runtime = CoreRuntime::new(CoreConfig::default(), Arc::new(MemoryStore::new()), None);
    let mut recovery = runtime.recovery_signals();

    let loading = AuthState {
        loading: true,
        ..AuthState::default()
    };

    let t0 = Utc::now();
    runtime.tick_at(loading, t0);
    assert!(runtime.coordinator().should_show_loading_at(t0));

    // The loading snapshot ages past the stuck bound with nothing newer
    let reports = runtime.watchdog().scan_at(t0 + Duration::seconds(40));
    assert!(reports.iter().any(|r| r.kind == AnomalyKind::StuckLoading));

    let signal = recovery.try_recv().unwrap();
    runtime.apply_recovery(&signal);

    // Fail-open also completed initialization independently of recovery
    assert!(!runtime
        .coordinator()
        .should_show_loading_at(t0 + Duration::seconds(60)));
}
