//! Fail-open application initialization.
//!
//! A two-state machine gating "app ready" on the authentication collaborator.
//! The coordinator does not care how auth resolved (authenticated,
//! unauthenticated, pending approval), only that the collaborator finished
//! loading. A deadline recorded on entering `Uninitialized` guarantees
//! forward progress: blocking the UI indefinitely is strictly worse than
//! briefly showing an under-determined state, so after the timeout the
//! coordinator initializes anyway.
//!
//! All timing is deadline-based; every public read applies the deadline
//! first, so no timer task is needed.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::config::CoreConfig;
use crate::lifecycle::LifecycleMonitor;

/// Signals read from the authentication collaborator. The core never
/// implements credential verification; it only observes these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthState {
    pub is_authenticated: bool,
    pub is_approved: bool,
    pub loading: bool,
    pub initialized: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPhase {
    Uninitialized,
    Initialized,
}

struct Inner {
    phase: InitPhase,
    entered_uninit_at: DateTime<Utc>,
    last_refresh_at: DateTime<Utc>,
    last_auth: Option<AuthState>,
}

/// Gates app readiness on the auth collaborator with a fail-open timeout.
pub struct InitCoordinator {
    inner: Mutex<Inner>,
    init_timeout_ms: i64,
    refresh_threshold_ms: i64,
}

impl InitCoordinator {
    pub fn new(config: &CoreConfig) -> Self {
        let now = Utc::now();
        Self {
            inner: Mutex::new(Inner {
                phase: InitPhase::Uninitialized,
                entered_uninit_at: now,
                last_refresh_at: now,
                last_auth: None,
            }),
            init_timeout_ms: config.init_timeout_ms,
            refresh_threshold_ms: config.data_refresh_threshold_ms,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Apply the fail-open deadline. Runs before every read and observation.
    fn sync_deadline(&self, inner: &mut Inner, now: DateTime<Utc>) {
        if inner.phase == InitPhase::Uninitialized
            && now - inner.entered_uninit_at >= Duration::milliseconds(self.init_timeout_ms)
        {
            warn!(
                timeout_ms = self.init_timeout_ms,
                "Auth collaborator never settled, initializing anyway"
            );
            Self::transition(inner, "fail-open timeout");
        }
    }

    fn transition(inner: &mut Inner, reason: &str) {
        inner.phase = InitPhase::Initialized;
        debug!(reason, "Initialization complete");
    }

    /// Feed the latest auth collaborator state. Transitions once the
    /// collaborator reports it finished loading, whatever the outcome.
    pub fn observe_auth(&self, auth: AuthState) {
        self.observe_auth_at(auth, Utc::now());
    }

    pub fn observe_auth_at(&self, auth: AuthState, now: DateTime<Utc>) {
        let mut inner = self.lock();
        inner.last_auth = Some(auth);
        self.sync_deadline(&mut inner, now);
        if inner.phase == InitPhase::Uninitialized && !auth.loading {
            Self::transition(&mut inner, "auth settled");
        }
    }

    pub fn phase(&self) -> InitPhase {
        self.phase_at(Utc::now())
    }

    pub fn phase_at(&self, now: DateTime<Utc>) -> InitPhase {
        let mut inner = self.lock();
        self.sync_deadline(&mut inner, now);
        inner.phase
    }

    /// True iff still `Uninitialized`
    pub fn should_show_loading(&self) -> bool {
        self.phase() == InitPhase::Uninitialized
    }

    pub fn should_show_loading_at(&self, now: DateTime<Utc>) -> bool {
        self.phase_at(now) == InitPhase::Uninitialized
    }

    /// True iff initialized and either the refresh threshold elapsed or the
    /// lifecycle monitor recommends a refresh.
    pub fn should_refresh_data(&self, lifecycle: &LifecycleMonitor) -> bool {
        self.should_refresh_data_at(lifecycle, Utc::now())
    }

    pub fn should_refresh_data_at(&self, lifecycle: &LifecycleMonitor, now: DateTime<Utc>) -> bool {
        let last_refresh_at = {
            let mut inner = self.lock();
            self.sync_deadline(&mut inner, now);
            if inner.phase != InitPhase::Initialized {
                return false;
            }
            inner.last_refresh_at
        };
        (now - last_refresh_at).num_milliseconds() > self.refresh_threshold_ms
            || lifecycle.should_refresh_data_at(last_refresh_at, self.refresh_threshold_ms, now)
    }

    pub fn mark_data_refreshed(&self) {
        self.mark_data_refreshed_at(Utc::now());
    }

    pub fn mark_data_refreshed_at(&self, now: DateTime<Utc>) {
        self.lock().last_refresh_at = now;
    }

    pub fn last_refresh_at(&self) -> DateTime<Utc> {
        self.lock().last_refresh_at
    }

    /// Reset to `Uninitialized` with a fresh fail-open deadline, then re-run
    /// the normal gate against the last observed auth state. If auth is
    /// already settled this returns to `Initialized` in the same call.
    pub fn force_initialization(&self) {
        self.force_initialization_at(Utc::now());
    }

    pub fn force_initialization_at(&self, now: DateTime<Utc>) {
        let mut inner = self.lock();
        inner.phase = InitPhase::Uninitialized;
        inner.entered_uninit_at = now;
        debug!("Forced reinitialization");
        if let Some(auth) = inner.last_auth {
            if !auth.loading {
                Self::transition(&mut inner, "forced, auth already settled");
            }
        }
    }
}
