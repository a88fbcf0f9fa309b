//! Cache-first data access.
//!
//! `DataAccessAdapter` is the pattern every domain data hook (posts, map
//! spots, inbox) instantiates: a cache namespace, the lifecycle monitor, and
//! a remote fetch function combined into "read cache, else fetch, else
//! stale-fallback" with request coalescing and bounded timeouts.
//!
//! Concurrent fetches for the same cache key are coalesced into a single
//! in-flight request: later callers await the same shared future instead of
//! issuing parallel remote calls. Timeouts and network failures fall back to
//! the last-known cache value (stale included); non-transient errors (auth,
//! server) always surface to the caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{de::DeserializeOwned, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::store::{CacheLookup, SharedStore};
use crate::config::CoreConfig;
use crate::error::FetchError;
use crate::lifecycle::LifecycleMonitor;
use crate::remote::{FetchFn, RecordFilter};

type InFlight<T> = Shared<BoxFuture<'static, Result<Vec<T>, FetchError>>>;

/// Optional payload normalization hook applied before write-through.
pub type Normalizer<T> = Arc<dyn Fn(Vec<T>) -> Vec<T> + Send + Sync>;

struct AdapterInner<T> {
    store: SharedStore<Vec<T>>,
    lifecycle: Arc<LifecycleMonitor>,
    fetch: FetchFn<T>,
    filter: RecordFilter,
    normalize: Option<Normalizer<T>>,
    /// The adapter's in-memory view, replaced wholesale on fetch/mutation
    records: Mutex<Vec<T>>,
    last_fetch_at: Mutex<Option<DateTime<Utc>>>,
    in_flight: Mutex<HashMap<String, InFlight<T>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    fetch_timeout_ms: i64,
    refresh_threshold_ms: i64,
}

/// Cache-first accessor for one remote collection.
/// Clone is cheap and shares the same view, cache key, and in-flight map.
pub struct DataAccessAdapter<T> {
    inner: Arc<AdapterInner<T>>,
}

impl<T> Clone for DataAccessAdapter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> DataAccessAdapter<T>
where
    T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    pub fn new(
        store: SharedStore<Vec<T>>,
        lifecycle: Arc<LifecycleMonitor>,
        filter: RecordFilter,
        fetch: FetchFn<T>,
        config: &CoreConfig,
    ) -> Self {
        Self {
            inner: Arc::new(AdapterInner {
                store,
                lifecycle,
                fetch,
                filter,
                normalize: None,
                records: Mutex::new(Vec::new()),
                last_fetch_at: Mutex::new(None),
                in_flight: Mutex::new(HashMap::new()),
                background: Mutex::new(Vec::new()),
                fetch_timeout_ms: config.profile().fetch_timeout_ms,
                refresh_threshold_ms: config.data_refresh_threshold_ms,
            }),
        }
    }

    pub fn with_normalizer(self, normalize: Normalizer<T>) -> Self {
        // Only sensible before first use, while the inner Arc is unshared
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.normalize = Some(normalize);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => Self { inner },
        }
    }

    fn lock_records(&self) -> MutexGuard<'_, Vec<T>> {
        self.inner.records.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// The current in-memory view.
    pub fn records(&self) -> Vec<T> {
        self.lock_records().clone()
    }

    pub fn last_fetch_at(&self) -> Option<DateTime<Utc>> {
        *self
            .inner
            .last_fetch_at
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    /// True when the lifecycle monitor recommends refreshing this
    /// collection on return to foreground.
    pub fn should_refresh_on_visible(&self) -> bool {
        match self.last_fetch_at() {
            Some(at) => self
                .inner
                .lifecycle
                .should_refresh_data(at, self.inner.refresh_threshold_ms),
            None => true,
        }
    }

    /// Fetch the collection.
    ///
    /// Unforced calls consult the cache first: a fresh hit returns
    /// immediately, a stale hit returns the stale value and schedules a
    /// non-blocking background refetch. Misses and forced calls go to the
    /// remote source.
    pub async fn fetch(&self, force_refresh: bool) -> Result<Vec<T>, FetchError> {
        let key = self.inner.filter.cache_key();

        if !force_refresh {
            match self.inner.store.lookup(&key) {
                CacheLookup::Fresh(records) => {
                    *self.lock_records() = records.clone();
                    return Ok(records);
                }
                CacheLookup::Stale(records) => {
                    debug!(key = %key, "Serving stale cache, scheduling background refetch");
                    self.spawn_background_refetch();
                    *self.lock_records() = records.clone();
                    return Ok(records);
                }
                CacheLookup::Miss => {}
            }
        }

        match self.coalesced_fetch().await {
            Ok(records) => Ok(records),
            Err(err) => {
                // Last-known value beats a transient failure, even expired.
                // Auth/server errors always surface.
                if err.is_transient() {
                    if let Some(records) = self.inner.store.peek_any(&key) {
                        warn!(key = %key, error = %err, "Remote fetch failed, using cached fallback");
                        *self.lock_records() = records.clone();
                        return Ok(records);
                    }
                }
                Err(err)
            }
        }
    }

    /// Join the in-flight request for this key, or start one.
    fn coalesced_fetch(&self) -> InFlight<T> {
        let key = self.inner.filter.cache_key();
        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if let Some(pending) = in_flight.get(&key) {
            debug!(key = %key, "Coalescing into in-flight fetch");
            return pending.clone();
        }

        let inner = Arc::clone(&self.inner);
        let slot_key = key.clone();
        let future = async move {
            let timeout = std::time::Duration::from_millis(inner.fetch_timeout_ms.max(0) as u64);
            let outcome =
                match tokio::time::timeout(timeout, (inner.fetch)(inner.filter.clone())).await {
                    Ok(Ok(records)) => {
                        let records = match inner.normalize {
                            Some(ref normalize) => normalize(records),
                            None => records,
                        };
                        inner.store.set(slot_key.clone(), records.clone());
                        *inner.records.lock().unwrap_or_else(|p| p.into_inner()) =
                            records.clone();
                        *inner
                            .last_fetch_at
                            .lock()
                            .unwrap_or_else(|p| p.into_inner()) = Some(Utc::now());
                        Ok(records)
                    }
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(FetchError::Timeout {
                        limit_ms: inner.fetch_timeout_ms,
                    }),
                };
            inner
                .in_flight
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&slot_key);
            outcome
        }
        .boxed()
        .shared();

        in_flight.insert(key, future.clone());
        future
    }

    /// Stale-while-revalidate: run the coalesced fetch without blocking the
    /// caller. The task handle is owned and aborted on shutdown.
    fn spawn_background_refetch(&self) {
        let future = self.coalesced_fetch();
        let handle = tokio::spawn(async move {
            let _ = future.await;
        });
        let mut background = self
            .inner
            .background
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        background.retain(|h| !h.is_finished());
        background.push(handle);
    }

    fn write_through(&self, records: Vec<T>) {
        let key = self.inner.filter.cache_key();
        self.inner.store.set(key, records.clone());
        *self.lock_records() = records;
    }

    /// Optimistic create: prepend to the in-memory list and write the whole
    /// recomputed list through. Invalidation is wholesale replacement, not
    /// fine-grained patching.
    pub fn apply_create(&self, record: T) {
        let mut records = self.records();
        records.insert(0, record);
        self.write_through(records);
    }

    /// Optimistic update: replace every record matching the predicate.
    pub fn apply_update(&self, matches: impl Fn(&T) -> bool, record: T) {
        let mut records = self.records();
        for slot in records.iter_mut().filter(|r| matches(r)) {
            *slot = record.clone();
        }
        self.write_through(records);
    }

    /// Optimistic delete: drop every record matching the predicate.
    pub fn apply_delete(&self, matches: impl Fn(&T) -> bool) {
        let mut records = self.records();
        records.retain(|r| !matches(r));
        self.write_through(records);
    }

    /// Abort background refetches and drop in-flight state. Mandatory
    /// teardown point so no network work outlives the owning consumer.
    pub fn shutdown(&self) {
        let mut background = self
            .inner
            .background
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        for handle in background.drain(..) {
            handle.abort();
        }
        drop(background);
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }
}

impl<T> Drop for AdapterInner<T> {
    fn drop(&mut self) {
        let background = self.background.get_mut().unwrap_or_else(|p| p.into_inner());
        for handle in background.drain(..) {
            handle.abort();
        }
    }
}
