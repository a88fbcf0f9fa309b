//! Anomaly detection over initialization/auth state.
//!
//! The watchdog keeps a small ring buffer of state snapshots and
//! periodically scans the recent window for stuck-loading, transition-loop,
//! and contradictory-auth conditions. Detection is strictly observational:
//! the watchdog only broadcasts a recovery signal, and remediation lives
//! with the coordinator and cache manager so the detection policy stays
//! independently testable and replaceable.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::CoreConfig;

/// Ring buffer capacity for state snapshots
const SNAPSHOT_HISTORY_SIZE: usize = 10;

/// Broadcast channel capacity for recovery signals
const RECOVERY_CHANNEL_SIZE: usize = 8;

/// One observation of coordinator/auth state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub timestamp: DateTime<Utc>,
    pub loading: bool,
    pub initialized: bool,
    pub authenticated: bool,
    pub approved: bool,
    pub reason: String,
}

impl StateSnapshot {
    /// Equality ignoring the timestamp, used for noise-reduction dedup
    fn same_state(&self, other: &StateSnapshot) -> bool {
        self.loading == other.loading
            && self.initialized == other.initialized
            && self.authenticated == other.authenticated
            && self.approved == other.approved
            && self.reason == other.reason
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyKind {
    /// A loading snapshot aged past the bound with nothing newer recorded
    StuckLoading,
    /// Too many snapshots inside a short window - a transition loop
    RapidStateChanges,
    /// authenticated && !approved && loading held simultaneously
    AuthInconsistency,
}

/// Transient scan finding; never persisted.
#[derive(Debug, Clone)]
pub struct AnomalyReport {
    pub kind: AnomalyKind,
    pub message: String,
    pub evidence: String,
}

/// Broadcast when an anomaly is detected or recovery is forced manually.
#[derive(Debug, Clone)]
pub struct RecoverySignal {
    pub reason: String,
    pub anomaly: Option<AnomalyKind>,
}

struct Inner {
    history: VecDeque<StateSnapshot>,
    last_scan_at: Option<DateTime<Utc>>,
    /// One StuckLoading report per continuous stuck period
    stuck_reported: bool,
}

pub struct AnomalyWatchdog {
    inner: Mutex<Inner>,
    signals: broadcast::Sender<RecoverySignal>,
    scan_interval_ms: i64,
    stuck_bound_ms: i64,
    rapid_window_ms: i64,
    rapid_count: usize,
}

impl AnomalyWatchdog {
    pub fn new(config: &CoreConfig) -> Self {
        let (signals, _) = broadcast::channel(RECOVERY_CHANNEL_SIZE);
        Self {
            inner: Mutex::new(Inner {
                history: VecDeque::with_capacity(SNAPSHOT_HISTORY_SIZE),
                last_scan_at: None,
                stuck_reported: false,
            }),
            signals,
            scan_interval_ms: config.watchdog_scan_interval_ms,
            stuck_bound_ms: config.stuck_loading_bound_ms,
            rapid_window_ms: config.rapid_change_window_ms,
            rapid_count: config.rapid_change_count,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Subscribe to recovery signals.
    pub fn subscribe(&self) -> broadcast::Receiver<RecoverySignal> {
        self.signals.subscribe()
    }

    /// Append a snapshot, skipping exact repeats of the previous one.
    pub fn record_snapshot(&self, snapshot: StateSnapshot) {
        let mut inner = self.lock();
        if let Some(last) = inner.history.back() {
            if last.same_state(&snapshot) {
                return;
            }
        }
        if inner.history.len() >= SNAPSHOT_HISTORY_SIZE {
            inner.history.pop_front();
        }
        inner.history.push_back(snapshot);
        // A genuinely new state ends any continuous stuck period
        inner.stuck_reported = false;
    }

    /// Snapshot history, oldest first.
    pub fn history(&self) -> Vec<StateSnapshot> {
        self.lock().history.iter().cloned().collect()
    }

    /// Run the scan if the interval has elapsed, broadcasting a recovery
    /// signal per finding. Intended to be driven from the host tick loop.
    pub fn tick(&self) -> Vec<AnomalyReport> {
        self.tick_at(Utc::now())
    }

    pub fn tick_at(&self, now: DateTime<Utc>) -> Vec<AnomalyReport> {
        {
            let mut inner = self.lock();
            let due = match inner.last_scan_at {
                None => true,
                Some(last) => now - last >= Duration::milliseconds(self.scan_interval_ms),
            };
            if !due {
                return Vec::new();
            }
            inner.last_scan_at = Some(now);
        }
        self.scan_at(now)
    }

    /// Scan the recent snapshot window, broadcasting per finding.
    pub fn scan_at(&self, now: DateTime<Utc>) -> Vec<AnomalyReport> {
        let mut reports = Vec::new();
        let mut inner = self.lock();

        // Stuck loading: newest snapshot is loading and nothing newer has
        // arrived within the bound
        if let Some(last) = inner.history.back().cloned() {
            let age_ms = (now - last.timestamp).num_milliseconds();
            if last.loading && age_ms > self.stuck_bound_ms && !inner.stuck_reported {
                inner.stuck_reported = true;
                reports.push(AnomalyReport {
                    kind: AnomalyKind::StuckLoading,
                    message: format!("Loading state stuck for {}ms", age_ms),
                    evidence: format!("last snapshot: {:?}", last),
                });
            }
        }

        // Transition loop: too many distinct snapshots in the recent window
        let window_start = now - Duration::milliseconds(self.rapid_window_ms);
        let recent = inner
            .history
            .iter()
            .filter(|s| s.timestamp > window_start)
            .count();
        if recent > self.rapid_count {
            reports.push(AnomalyReport {
                kind: AnomalyKind::RapidStateChanges,
                message: format!(
                    "{} state changes within {}ms",
                    recent, self.rapid_window_ms
                ),
                evidence: format!("{} snapshots in window", recent),
            });
        }

        // Contradictory auth combination that should never persist
        if let Some(last) = inner.history.back() {
            if last.authenticated && !last.approved && last.loading {
                reports.push(AnomalyReport {
                    kind: AnomalyKind::AuthInconsistency,
                    message: "Authenticated but unapproved while still loading".to_string(),
                    evidence: format!("last snapshot: {:?}", last),
                });
            }
        }

        drop(inner);

        for report in &reports {
            warn!(kind = ?report.kind, message = %report.message, "Anomaly detected");
            let _ = self.signals.send(RecoverySignal {
                reason: report.message.clone(),
                anomaly: Some(report.kind),
            });
        }
        reports
    }

    /// Manual escape hatch: record a synthetic recovered snapshot and
    /// broadcast the same recovery signal the scan would.
    pub fn force_recovery(&self, reason: &str) {
        self.force_recovery_at(reason, Utc::now());
    }

    pub fn force_recovery_at(&self, reason: &str, now: DateTime<Utc>) {
        debug!(reason, "Manual recovery requested");
        self.record_snapshot(StateSnapshot {
            timestamp: now,
            loading: false,
            initialized: true,
            authenticated: false,
            approved: false,
            reason: format!("recovered: {}", reason),
        });
        let _ = self.signals.send(RecoverySignal {
            reason: reason.to_string(),
            anomaly: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watchdog() -> AnomalyWatchdog {
        AnomalyWatchdog::new(&CoreConfig::default())
    }

    fn snapshot(timestamp: DateTime<Utc>, loading: bool, reason: &str) -> StateSnapshot {
        StateSnapshot {
            timestamp,
            loading,
            initialized: !loading,
            authenticated: false,
            approved: false,
            reason: reason.to_string(),
        }
    }

    #[test]
    fn test_dedup_against_previous_snapshot() {
        let w = watchdog();
        let t0 = Utc::now();
        w.record_snapshot(snapshot(t0, true, "boot"));
        w.record_snapshot(snapshot(t0 + Duration::seconds(1), true, "boot"));
        assert_eq!(w.history().len(), 1);

        w.record_snapshot(snapshot(t0 + Duration::seconds(2), false, "boot"));
        assert_eq!(w.history().len(), 2);
    }

    #[test]
    fn test_history_is_bounded() {
        let w = watchdog();
        let t0 = Utc::now();
        for i in 0..25 {
            w.record_snapshot(snapshot(t0 + Duration::seconds(i), i % 2 == 0, "step"));
        }
        assert_eq!(w.history().len(), SNAPSHOT_HISTORY_SIZE);
    }

    #[test]
    fn test_stuck_loading_reported_once_per_period() {
        let w = watchdog();
        let t0 = Utc::now();
        w.record_snapshot(snapshot(t0, true, "boot"));

        // Unchanged loading snapshot past the 30s bound
        let reports = w.scan_at(t0 + Duration::seconds(40));
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, AnomalyKind::StuckLoading);

        // Still stuck: no duplicate report for the same continuous period
        let reports = w.scan_at(t0 + Duration::seconds(80));
        assert!(reports.is_empty());

        // A new state ends the period; a fresh stuck period reports again
        w.record_snapshot(snapshot(t0 + Duration::seconds(90), true, "retry"));
        let reports = w.scan_at(t0 + Duration::seconds(140));
        assert_eq!(reports.len(), 1);
    }

    #[test]
    fn test_rapid_state_changes() {
        let w = watchdog();
        let t0 = Utc::now();
        for i in 0..7 {
            w.record_snapshot(snapshot(t0 + Duration::seconds(i), i % 2 == 0, "flap"));
        }
        let reports = w.scan_at(t0 + Duration::seconds(8));
        assert!(reports
            .iter()
            .any(|r| r.kind == AnomalyKind::RapidStateChanges));
    }

    #[test]
    fn test_auth_inconsistency() {
        let w = watchdog();
        let t0 = Utc::now();
        w.record_snapshot(StateSnapshot {
            timestamp: t0,
            loading: true,
            initialized: false,
            authenticated: true,
            approved: false,
            reason: "contradiction".to_string(),
        });
        let reports = w.scan_at(t0 + Duration::seconds(1));
        assert!(reports
            .iter()
            .any(|r| r.kind == AnomalyKind::AuthInconsistency));
    }

    #[test]
    fn test_scan_broadcasts_recovery_signal() {
        let w = watchdog();
        let mut rx = w.subscribe();
        let t0 = Utc::now();
        w.record_snapshot(snapshot(t0, true, "boot"));
        w.scan_at(t0 + Duration::seconds(40));

        let signal = rx.try_recv().unwrap();
        assert_eq!(signal.anomaly, Some(AnomalyKind::StuckLoading));
    }

    #[test]
    fn test_tick_honors_scan_interval() {
        let w = watchdog();
        let t0 = Utc::now();
        w.record_snapshot(snapshot(t0, true, "boot"));

        // First tick scans; stuck bound not yet reached, nothing found
        assert!(w.tick_at(t0 + Duration::seconds(1)).is_empty());
        // Within the 30s interval the tick is a no-op even though the
        // snapshot is now stuck
        assert!(w.tick_at(t0 + Duration::seconds(20)).is_empty());
        // Next due tick finds it
        assert_eq!(w.tick_at(t0 + Duration::seconds(40)).len(), 1);
    }

    #[test]
    fn test_force_recovery() {
        let w = watchdog();
        let mut rx = w.subscribe();
        w.force_recovery("user pressed reset");

        let signal = rx.try_recv().unwrap();
        assert_eq!(signal.reason, "user pressed reset");
        assert_eq!(signal.anomaly, None);

        let history = w.history();
        assert!(history.last().unwrap().reason.starts_with("recovered:"));
    }
}
