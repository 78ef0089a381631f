//! Circuit breaker for the remote (L2) store
//!
//! `Healthy ⇄ Unhealthy → (after cooldown) Unknown → (next attempt) Healthy | Unhealthy`
//!
//! While `Unhealthy` no remote call is admitted. When the cooldown measured
//! from the trip elapses the state resets to `Unknown`, and from `Unknown`
//! exactly one caller at a time is admitted as a probe whose result decides
//! the next state. The initial state is `Unknown`.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Unknown,
}

impl HealthState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Healthy,
            1 => Self::Unhealthy,
            _ => Self::Unknown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Unhealthy => 1,
            Self::Unknown => 2,
        }
    }
}

/// Shared health state for one remote store. Clones share the same state.
#[derive(Clone)]
pub struct RemoteHealth {
    inner: Arc<HealthInner>,
}

struct HealthInner {
    state: AtomicU8,
    cooldown: Duration,
    failure_threshold: u32,
    consecutive_failures: AtomicU32,
    /// Bumped on every trip so a stale reset timer cannot reopen a newer trip
    generation: AtomicU64,
    probe_in_flight: AtomicBool,
    tripped_at: Mutex<Option<Instant>>,
    last_healthy_at: Mutex<Option<Instant>>,
}

/// Permission to issue one remote call.
///
/// Dropping a probe admission without a verdict (the call was cancelled or
/// failed for a reason unrelated to connectivity) frees the probe slot.
#[must_use]
pub struct Admission<'a> {
    health: &'a RemoteHealth,
    probe: bool,
}

impl Admission<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.probe {
            self.health
                .inner
                .probe_in_flight
                .store(false, Ordering::Release);
        }
    }
}

impl RemoteHealth {
    pub fn new(cooldown: Duration, failure_threshold: u32) -> Self {
        Self {
            inner: Arc::new(HealthInner {
                state: AtomicU8::new(HealthState::Unknown.as_u8()),
                cooldown,
                failure_threshold: failure_threshold.max(1),
                consecutive_failures: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                probe_in_flight: AtomicBool::new(false),
                tripped_at: Mutex::new(None),
                last_healthy_at: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> HealthState {
        let state = HealthState::from_u8(self.inner.state.load(Ordering::Acquire));
        if state == HealthState::Unhealthy && self.cooldown_elapsed() {
            self.reset_to_unknown(self.inner.generation.load(Ordering::Acquire));
            return HealthState::from_u8(self.inner.state.load(Ordering::Acquire));
        }
        state
    }

    pub fn cooldown(&self) -> Duration {
        self.inner.cooldown
    }

    /// When the store last went from not-healthy to healthy
    pub fn last_healthy_at(&self) -> Option<Instant> {
        *lock(&self.inner.last_healthy_at)
    }

    /// Ask to issue a remote call. `None` means the circuit is open.
    pub fn admit(&self) -> Option<Admission<'_>> {
        match self.state() {
            HealthState::Healthy => Some(Admission {
                health: self,
                probe: false,
            }),
            HealthState::Unhealthy => None,
            HealthState::Unknown => self
                .inner
                .probe_in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .ok()
                .map(|_| Admission {
                    health: self,
                    probe: true,
                }),
        }
    }

    /// Record a successful round trip
    pub fn set_healthy(&self) {
        self.inner.consecutive_failures.store(0, Ordering::Release);
        let previous = self
            .inner
            .state
            .swap(HealthState::Healthy.as_u8(), Ordering::AcqRel);
        if previous != HealthState::Healthy.as_u8() {
            *lock(&self.inner.last_healthy_at) = Some(Instant::now());
            info!("Remote cache connection is healthy");
        }
    }

    /// Record a connectivity failure; opens the circuit once the threshold
    /// of consecutive failures is reached, or immediately for a probe.
    pub fn record_failure(&self) {
        let failures = self.inner.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        let state = HealthState::from_u8(self.inner.state.load(Ordering::Acquire));
        if failures >= self.inner.failure_threshold || state == HealthState::Unknown {
            self.set_unhealthy();
        } else {
            warn!(
                "Remote cache connectivity failure {}/{}",
                failures, self.inner.failure_threshold
            );
        }
    }

    /// Open the circuit and schedule the reset to `Unknown` after the cooldown
    pub fn set_unhealthy(&self) {
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *lock(&self.inner.tripped_at) = Some(Instant::now());
        self.inner
            .state
            .store(HealthState::Unhealthy.as_u8(), Ordering::Release);
        error!(
            "Remote cache marked unhealthy; bypassing it for {:?}",
            self.inner.cooldown
        );

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let health = self.clone();
                let cooldown = self.inner.cooldown;
                handle.spawn(async move {
                    tokio::time::sleep(cooldown).await;
                    health.reset_to_unknown(generation);
                });
            }
            Err(_) => {
                debug!("No runtime for health reset timer; cooldown is checked on read");
            }
        }
    }

    fn cooldown_elapsed(&self) -> bool {
        lock(&self.inner.tripped_at)
            .is_some_and(|at| Instant::now().saturating_duration_since(at) >= self.inner.cooldown)
    }

    fn reset_to_unknown(&self, generation: u64) {
        if self.inner.generation.load(Ordering::Acquire) != generation {
            return;
        }
        if self
            .inner
            .state
            .compare_exchange(
                HealthState::Unhealthy.as_u8(),
                HealthState::Unknown.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.inner.consecutive_failures.store(0, Ordering::Release);
            info!("Remote cache cooldown elapsed; next call will probe");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
