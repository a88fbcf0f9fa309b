//! Foreground/background lifecycle tracking.
//!
//! The `LifecycleMonitor` is the single source of visibility truth: platform
//! events (visibility change, focus, blur, online/offline) and a periodic
//! consistency poll both feed one canonical `VisibilityState`, and every
//! derived heuristic (usage pattern, refresh recommendation) is a read-only
//! computation over it.
//!
//! Consumers subscribe to a broadcast channel of `LifecycleSignal`s. On
//! constrained devices signal emission is throttled to bound downstream
//! re-render work; state mutations always apply immediately, and the final
//! state of a burst is flushed by the next consistency poll, so only
//! intermediate notifications are ever dropped.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::CoreConfig;

/// Broadcast channel capacity.
/// 32 is sufficient for lifecycle bursts with headroom.
const SIGNAL_CHANNEL_SIZE: usize = 32;

/// Toggle count above which the user counts as actively switching
const ACTIVE_USER_TOGGLES: u32 = 3;

/// Session duration above which the session counts as long (10 minutes)
const LONG_SESSION_MS: i64 = 10 * 60 * 1000;

/// Background duration above which the absence counts as long (5 minutes)
const LONG_BACKGROUND_MS: i64 = 5 * 60 * 1000;

/// Raw platform lifecycle events, processed in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformEvent {
    VisibilityChanged(bool),
    Focused,
    Blurred,
    Online,
    Offline,
}

/// Signals broadcast to lifecycle consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// Hidden -> visible transition, with the elapsed background duration
    BecameVisible { background_ms: i64 },
    /// Visible -> hidden transition
    BecameHidden,
    ConnectivityChanged { online: bool },
}

/// Canonical visibility state, mutated only by the monitor.
#[derive(Debug, Clone)]
pub struct VisibilityState {
    pub is_visible: bool,
    pub is_online: bool,
    pub last_visible_at: DateTime<Utc>,
    pub last_hidden_at: Option<DateTime<Utc>>,
    /// Duration of the most recent completed background period
    pub background_duration_ms: i64,
    pub toggle_count: u32,
    pub session_started_at: DateTime<Utc>,
}

impl VisibilityState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            is_visible: true,
            is_online: true,
            last_visible_at: now,
            last_hidden_at: None,
            background_duration_ms: 0,
            toggle_count: 0,
            session_started_at: now,
        }
    }
}

/// Derived usage heuristics, read-only over `VisibilityState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsagePattern {
    pub is_active_user: bool,
    pub is_long_session: bool,
    pub was_long_background: bool,
}

struct MonitorInner {
    state: VisibilityState,
    last_emit_at: Option<DateTime<Utc>>,
    /// Throttled signal awaiting the next flush; overwritten by newer
    /// signals so only the final state of a burst survives
    pending: Option<LifecycleSignal>,
}

/// Observes platform visibility/focus/online signals and exposes refresh
/// heuristics. One instance per process, injected into every consumer.
pub struct LifecycleMonitor {
    inner: Mutex<MonitorInner>,
    signals: broadcast::Sender<LifecycleSignal>,
    notify_throttle_ms: i64,
    consistency_poll_ms: i64,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleMonitor {
    pub fn new(config: &CoreConfig) -> Self {
        let profile = config.profile();
        let (signals, _) = broadcast::channel(SIGNAL_CHANNEL_SIZE);
        Self {
            inner: Mutex::new(MonitorInner {
                state: VisibilityState::new(Utc::now()),
                last_emit_at: None,
                pending: None,
            }),
            signals,
            notify_throttle_ms: profile.notify_throttle_ms,
            consistency_poll_ms: profile.consistency_poll_ms,
            poll_handle: Mutex::new(None),
        }
    }

    /// Subscribe to lifecycle signals.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleSignal> {
        self.signals.subscribe()
    }

    /// Snapshot of the canonical visibility state.
    pub fn state(&self) -> VisibilityState {
        self.lock().state.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MonitorInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Process a platform event.
    pub fn handle_event(&self, event: PlatformEvent) {
        self.handle_event_at(event, Utc::now());
    }

    /// Process a platform event with an explicit timestamp (deterministic
    /// embedding and tests).
    pub fn handle_event_at(&self, event: PlatformEvent, now: DateTime<Utc>) {
        let mut inner = self.lock();
        match event {
            PlatformEvent::VisibilityChanged(visible) => {
                self.apply_visibility(&mut inner, visible, now)
            }
            PlatformEvent::Focused => self.apply_visibility(&mut inner, true, now),
            PlatformEvent::Blurred => self.apply_visibility(&mut inner, false, now),
            PlatformEvent::Online | PlatformEvent::Offline => {
                let online = event == PlatformEvent::Online;
                if inner.state.is_online != online {
                    inner.state.is_online = online;
                    self.emit(&mut inner, LifecycleSignal::ConnectivityChanged { online }, now);
                }
            }
        }
    }

    /// Transition handling. Repeated events for the current side are no-ops,
    /// so each transition notifies at most once.
    fn apply_visibility(&self, inner: &mut MonitorInner, visible: bool, now: DateTime<Utc>) {
        if inner.state.is_visible == visible {
            return;
        }
        if visible {
            let background_ms = inner
                .state
                .last_hidden_at
                .map(|hidden| (now - hidden).num_milliseconds().max(0))
                .unwrap_or(0);
            inner.state.is_visible = true;
            inner.state.last_visible_at = now;
            inner.state.background_duration_ms = background_ms;
            inner.state.toggle_count += 1;
            debug!(background_ms, toggles = inner.state.toggle_count, "App became visible");
            self.emit(inner, LifecycleSignal::BecameVisible { background_ms }, now);
        } else {
            inner.state.is_visible = false;
            inner.state.last_hidden_at = Some(now);
            debug!("App became hidden");
            self.emit(inner, LifecycleSignal::BecameHidden, now);
        }
    }

    fn emit(&self, inner: &mut MonitorInner, signal: LifecycleSignal, now: DateTime<Utc>) {
        if self.notify_throttle_ms > 0 {
            if let Some(last) = inner.last_emit_at {
                if (now - last).num_milliseconds() < self.notify_throttle_ms {
                    inner.pending = Some(signal);
                    return;
                }
            }
        }
        inner.last_emit_at = Some(now);
        inner.pending = None;
        // No receivers is fine
        let _ = self.signals.send(signal);
    }

    /// Periodic consistency check correcting any missed platform event, and
    /// the flush point for throttled signals.
    pub fn poll_consistency(&self, observed_visible: bool) {
        self.poll_consistency_at(observed_visible, Utc::now());
    }

    pub fn poll_consistency_at(&self, observed_visible: bool, now: DateTime<Utc>) {
        let mut inner = self.lock();
        if inner.state.is_visible != observed_visible {
            warn!(observed_visible, "Visibility drift detected, synthesizing transition");
            self.apply_visibility(&mut inner, observed_visible, now);
        }
        // The final state of a throttled burst goes out here
        if let Some(signal) = inner.pending.take() {
            inner.last_emit_at = Some(now);
            let _ = self.signals.send(signal);
        }
    }

    /// True when data fetched at `last_fetch_at` should be refreshed: either
    /// it is older than the threshold, or the last background period was
    /// longer than the threshold.
    pub fn should_refresh_data(&self, last_fetch_at: DateTime<Utc>, threshold_ms: i64) -> bool {
        self.should_refresh_data_at(last_fetch_at, threshold_ms, Utc::now())
    }

    pub fn should_refresh_data_at(
        &self,
        last_fetch_at: DateTime<Utc>,
        threshold_ms: i64,
        now: DateTime<Utc>,
    ) -> bool {
        let inner = self.lock();
        (now - last_fetch_at).num_milliseconds() > threshold_ms
            || inner.state.background_duration_ms > threshold_ms
    }

    pub fn usage_pattern(&self) -> UsagePattern {
        self.usage_pattern_at(Utc::now())
    }

    pub fn usage_pattern_at(&self, now: DateTime<Utc>) -> UsagePattern {
        let inner = self.lock();
        UsagePattern {
            is_active_user: inner.state.toggle_count > ACTIVE_USER_TOGGLES,
            is_long_session: (now - inner.state.session_started_at).num_milliseconds()
                > LONG_SESSION_MS,
            was_long_background: inner.state.background_duration_ms > LONG_BACKGROUND_MS,
        }
    }

    /// Spawn the consistency-poll helper. `probe` reports the platform's
    /// current visibility. The returned task is owned by the monitor and
    /// aborted by `shutdown`.
    pub fn spawn_consistency_poll(
        self: &Arc<Self>,
        probe: impl Fn() -> bool + Send + Sync + 'static,
    ) {
        let weak = Arc::downgrade(self);
        let interval = std::time::Duration::from_millis(self.consistency_poll_ms.max(0) as u64);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(monitor) = weak.upgrade() else {
                    break;
                };
                monitor.poll_consistency(probe());
            }
        });
        let mut slot = self.poll_handle.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    /// Remove the consistency-poll task. Mandatory teardown point so no
    /// background work outlives the monitor's consumers.
    pub fn shutdown(&self) {
        let mut slot = self.poll_handle.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }
}

impl Drop for LifecycleMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceClass;
    use chrono::Duration;

    fn monitor() -> LifecycleMonitor {
        LifecycleMonitor::new(&CoreConfig::default())
    }

    fn constrained_monitor() -> LifecycleMonitor {
        LifecycleMonitor::new(&CoreConfig {
            device_class: DeviceClass::Constrained,
            ..CoreConfig::default()
        })
    }

    #[test]
    fn test_hidden_visible_transition() {
        // Scenario C: hidden at t=0, visible at t=600000
        let m = monitor();
        let t0 = Utc::now();
        let mut rx = m.subscribe();

        m.handle_event_at(PlatformEvent::VisibilityChanged(false), t0);
        m.handle_event_at(
            PlatformEvent::VisibilityChanged(true),
            t0 + Duration::milliseconds(600_000),
        );

        let state = m.state();
        assert!(state.is_visible);
        assert_eq!(state.background_duration_ms, 600_000);
        assert_eq!(state.toggle_count, 1);

        assert_eq!(rx.try_recv().unwrap(), LifecycleSignal::BecameHidden);
        assert_eq!(
            rx.try_recv().unwrap(),
            LifecycleSignal::BecameVisible { background_ms: 600_000 }
        );

        let pattern = m.usage_pattern_at(t0 + Duration::milliseconds(600_000));
        assert!(pattern.was_long_background);

        assert!(m.should_refresh_data_at(
            t0,
            300_000,
            t0 + Duration::milliseconds(600_000)
        ));
    }

    #[test]
    fn test_duplicate_events_notify_once() {
        let m = monitor();
        let t0 = Utc::now();
        let mut rx = m.subscribe();

        m.handle_event_at(PlatformEvent::VisibilityChanged(false), t0);
        m.handle_event_at(PlatformEvent::Blurred, t0 + Duration::milliseconds(10));
        m.handle_event_at(PlatformEvent::VisibilityChanged(false), t0 + Duration::milliseconds(20));

        assert_eq!(rx.try_recv().unwrap(), LifecycleSignal::BecameHidden);
        assert!(rx.try_recv().is_err());
        assert_eq!(m.state().toggle_count, 0);
    }

    #[test]
    fn test_focus_blur_map_to_visibility() {
        let m = monitor();
        let t0 = Utc::now();

        m.handle_event_at(PlatformEvent::Blurred, t0);
        assert!(!m.state().is_visible);
        m.handle_event_at(PlatformEvent::Focused, t0 + Duration::milliseconds(500));
        assert!(m.state().is_visible);
        assert_eq!(m.state().background_duration_ms, 500);
    }

    #[test]
    fn test_consistency_poll_corrects_missed_event() {
        let m = monitor();
        let t0 = Utc::now();

        // Platform went hidden without an event reaching us
        m.poll_consistency_at(false, t0);
        assert!(!m.state().is_visible);
        assert_eq!(m.state().last_hidden_at, Some(t0));
    }

    #[test]
    fn test_throttle_keeps_final_state_of_burst() {
        let m = constrained_monitor();
        let t0 = Utc::now();
        let mut rx = m.subscribe();

        // Rapid toggle burst inside the 2s throttle window
        m.handle_event_at(PlatformEvent::VisibilityChanged(false), t0);
        m.handle_event_at(
            PlatformEvent::VisibilityChanged(true),
            t0 + Duration::milliseconds(100),
        );
        m.handle_event_at(
            PlatformEvent::VisibilityChanged(false),
            t0 + Duration::milliseconds(200),
        );

        // First emission goes out, the rest are coalesced
        assert_eq!(rx.try_recv().unwrap(), LifecycleSignal::BecameHidden);
        assert!(rx.try_recv().is_err());

        // State itself is never throttled
        assert!(!m.state().is_visible);
        assert_eq!(m.state().toggle_count, 1);

        // Consistency poll flushes the final signal of the burst
        m.poll_consistency_at(false, t0 + Duration::milliseconds(5_000));
        assert_eq!(rx.try_recv().unwrap(), LifecycleSignal::BecameHidden);
    }

    #[test]
    fn test_should_refresh_on_stale_fetch() {
        let m = monitor();
        let now = Utc::now();
        assert!(m.should_refresh_data_at(now - Duration::milliseconds(400_000), 300_000, now));
        assert!(!m.should_refresh_data_at(now - Duration::milliseconds(100_000), 300_000, now));
    }

    #[test]
    fn test_should_refresh_after_long_background() {
        let m = monitor();
        let t0 = Utc::now();
        m.handle_event_at(PlatformEvent::VisibilityChanged(false), t0);
        m.handle_event_at(
            PlatformEvent::VisibilityChanged(true),
            t0 + Duration::milliseconds(400_000),
        );

        // Fetch is recent, but the background period exceeded the threshold
        let now = t0 + Duration::milliseconds(400_100);
        assert!(m.should_refresh_data_at(now, 300_000, now));
    }

    #[test]
    fn test_usage_pattern_active_user() {
        let m = monitor();
        let mut t = Utc::now();
        for _ in 0..4 {
            m.handle_event_at(PlatformEvent::VisibilityChanged(false), t);
            t = t + Duration::seconds(10);
            m.handle_event_at(PlatformEvent::VisibilityChanged(true), t);
            t = t + Duration::seconds(10);
        }
        let pattern = m.usage_pattern_at(t);
        assert!(pattern.is_active_user);
    }

    #[test]
    fn test_connectivity_signal() {
        let m = monitor();
        let mut rx = m.subscribe();
        m.handle_event_at(PlatformEvent::Offline, Utc::now());
        assert_eq!(
            rx.try_recv().unwrap(),
            LifecycleSignal::ConnectivityChanged { online: false }
        );
        // Repeated offline is a no-op
        m.handle_event_at(PlatformEvent::Offline, Utc::now());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_aborts_poll_task() {
        let m = Arc::new(monitor());
        m.spawn_consistency_poll(|| true);
        m.shutdown();
        // Idempotent
        m.shutdown();
    }
}
