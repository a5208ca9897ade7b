//! Per-backend circuit breaker.
//!
//! An explicit closed → open → half-open state machine. Every transition is
//! a plain function of the current state and an [`Instant`], so the whole
//! machine can be driven by synthetic success/failure sequences in tests.
//!
//! Calls are admitted through [`CircuitBreaker::try_acquire`], which hands
//! out a [`CallPermit`]. The permit must be settled with
//! [`CallPermit::succeed`], [`CallPermit::fail`] or [`CallPermit::release`];
//! a permit dropped unsettled (an abandoned call) counts as a failure.

use fleet_core::config::CircuitBreakerConfig;
use fleet_core::events::{emit, FleetEvent};
use fleet_core::{BackendId, CircuitState, FleetError, FleetResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Current cooldown, grows on failed probes.
    cooldown: Duration,
    probe_in_flight: bool,
    trips: u64,
    rejected: u64,
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerState {
    pub backend: BackendId,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Milliseconds since the circuit last opened.
    pub opened_ms_ago: Option<u64>,
    pub cooldown_ms: u64,
    pub trips: u64,
    pub rejected: u64,
}

/// Failure-tracking guard for one backend.
#[derive(Debug)]
pub struct CircuitBreaker {
    backend: BackendId,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

type Transition = (CircuitState, CircuitState, u32);

impl CircuitBreaker {
    /// Closed breaker for `backend`.
    pub fn new(backend: BackendId, config: CircuitBreakerConfig) -> Self {
        info!(
            backend = %backend,
            failure_threshold = config.failure_threshold,
            cooldown_secs = config.cooldown_secs,
            "Circuit breaker initialized"
        );
        let cooldown = config.cooldown();
        Self {
            backend,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                cooldown,
                probe_in_flight: false,
                trips: 0,
                rejected: 0,
            }),
        }
    }

    /// Backend this breaker guards.
    pub fn backend(&self) -> BackendId {
        self.backend
    }

    /// State as of the last recorded transition.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Asks to place one call now.
    pub fn try_acquire(&self) -> FleetResult<CallPermit<'_>> {
        self.try_acquire_at(Instant::now())
    }

    /// Asks to place one call at `now`.
    ///
    /// Open circuits reject until the cooldown has elapsed since `opened_at`;
    /// the first caller after that becomes the single half-open probe.
    pub fn try_acquire_at(&self, now: Instant) -> FleetResult<CallPermit<'_>> {
        let mut transition = None;
        let result = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => Ok(false),
                CircuitState::Open => {
                    let elapsed = inner
                        .opened_at
                        .map(|at| now.saturating_duration_since(at))
                        .unwrap_or(Duration::MAX);
                    if elapsed >= inner.cooldown {
                        inner.state = CircuitState::HalfOpen;
                        inner.probe_in_flight = true;
                        transition = Some((
                            CircuitState::Open,
                            CircuitState::HalfOpen,
                            inner.consecutive_failures,
                        ));
                        Ok(true)
                    } else {
                        inner.rejected += 1;
                        Err(FleetError::BackendUnavailable {
                            backend: self.backend,
                        })
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.probe_in_flight {
                        inner.rejected += 1;
                        Err(FleetError::BackendUnavailable {
                            backend: self.backend,
                        })
                    } else {
                        inner.probe_in_flight = true;
                        Ok(true)
                    }
                }
            }
        };
        self.announce(transition);
        result.map(|probe| CallPermit {
            breaker: self,
            probe,
            settled: false,
        })
    }

    /// Whether a call would currently be admitted, without taking a permit.
    pub fn allows_calls_at(&self, now: Instant) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner
                .opened_at
                .map(|at| now.saturating_duration_since(at) >= inner.cooldown)
                .unwrap_or(true),
            CircuitState::HalfOpen => !inner.probe_in_flight,
        }
    }

    /// Whether a call would be admitted right now.
    pub fn allows_calls(&self) -> bool {
        self.allows_calls_at(Instant::now())
    }

    /// Runs `f` under a permit, settling it by the outcome.
    ///
    /// Errors that do not count as backend failures (for example
    /// `OverCapacity`) release the permit without touching the counters.
    pub async fn call<F, Fut, T>(&self, f: F) -> FleetResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FleetResult<T>>,
    {
        let permit = self.try_acquire()?;
        match f().await {
            Ok(value) => {
                permit.succeed();
                Ok(value)
            }
            Err(e) if e.is_backend_failure() => {
                permit.fail();
                Err(e)
            }
            Err(e) => {
                permit.release();
                Err(e)
            }
        }
    }

    /// Serializable view of the breaker.
    pub fn snapshot(&self) -> CircuitBreakerState {
        self.snapshot_at(Instant::now())
    }

    /// Like [`Self::snapshot`], at an injected instant.
    pub fn snapshot_at(&self, now: Instant) -> CircuitBreakerState {
        let inner = self.inner.lock();
        CircuitBreakerState {
            backend: self.backend,
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_ms_ago: inner
                .opened_at
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            cooldown_ms: inner.cooldown.as_millis() as u64,
            trips: inner.trips,
            rejected: inner.rejected,
        }
    }

    /// Forces the breaker closed (operator override).
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            let from = inner.state;
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.opened_at = None;
            inner.probe_in_flight = false;
            inner.cooldown = self.config.cooldown();
            (from != CircuitState::Closed).then_some((from, CircuitState::Closed, 0))
        };
        self.announce(transition);
    }

    fn on_success(&self, probe: bool) {
        let transition = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen if probe => {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                    inner.probe_in_flight = false;
                    inner.cooldown = self.config.cooldown();
                    Some((CircuitState::HalfOpen, CircuitState::Closed, 0))
                }
                // Stale results from calls admitted before the circuit opened.
                _ => None,
            }
        };
        self.announce(transition);
    }

    fn on_failure(&self, probe: bool, now: Instant) {
        let transition = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        inner.state = CircuitState::Open;
                        inner.opened_at = Some(now);
                        inner.trips += 1;
                        Some((
                            CircuitState::Closed,
                            CircuitState::Open,
                            inner.consecutive_failures,
                        ))
                    } else {
                        debug!(
                            backend = %self.backend,
                            consecutive_failures = inner.consecutive_failures,
                            "Backend call failed"
                        );
                        None
                    }
                }
                CircuitState::HalfOpen if probe => {
                    inner.consecutive_failures += 1;
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    inner.probe_in_flight = false;
                    inner.trips += 1;
                    let grown = inner.cooldown.mul_f64(self.config.backoff_multiplier);
                    inner.cooldown = grown.min(self.config.max_cooldown());
                    Some((
                        CircuitState::HalfOpen,
                        CircuitState::Open,
                        inner.consecutive_failures,
                    ))
                }
                _ => None,
            }
        };
        self.announce(transition);
    }

    fn on_release(&self, probe: bool) {
        if probe {
            let mut inner = self.inner.lock();
            if inner.state == CircuitState::HalfOpen {
                inner.probe_in_flight = false;
            }
        }
    }

    fn announce(&self, transition: Option<Transition>) {
        let Some((from, to, consecutive_failures)) = transition else {
            return;
        };
        if to == CircuitState::Open {
            warn!(backend = %self.backend, %from, %to, consecutive_failures, "Circuit opened");
        } else {
            info!(backend = %self.backend, %from, %to, "Circuit state changed");
        }
        emit(&FleetEvent::CircuitTransition {
            backend: self.backend,
            from,
            to,
            consecutive_failures,
        });
    }
}

/// Admission to place one call through a [`CircuitBreaker`].
#[must_use = "an unsettled permit is recorded as a failure when dropped"]
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl CallPermit<'_> {
    /// Whether this call is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Records a successful call.
    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    /// Records a failed call.
    pub fn fail(self) {
        self.fail_at(Instant::now());
    }

    /// Records a failed call at an injected instant.
    pub fn fail_at(mut self, now: Instant) {
        self.settled = true;
        self.breaker.on_failure(self.probe, now);
    }

    /// The backend was never contacted; counters stay untouched.
    pub fn release(mut self) {
        self.settled = true;
        self.breaker.on_release(self.probe);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_failure(self.probe, Instant::now());
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(threshold: u32, cooldown_secs: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown_secs,
            backoff_multiplier: 2.0,
            max_cooldown_secs: 300,
        }
    }

    fn fail_n(breaker: &CircuitBreaker, n: u32, now: Instant) {
        for _ in 0..n {
            breaker.try_acquire_at(now).unwrap().fail_at(now);
        }
    }

    // ── Test 1: threshold opens the circuit ──

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new(BackendId::Fast, config(3, 60));
        let t0 = Instant::now();
        fail_n(&breaker, 2, t0);
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail_n(&breaker, 1, t0);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.snapshot_at(t0).consecutive_failures, 3);
        assert_eq!(breaker.snapshot_at(t0).trips, 1);
    }

    // ── Test 2: open circuit rejects until cooldown ──

    #[test]
    fn test_rejects_during_cooldown() {
        let breaker = CircuitBreaker::new(BackendId::Fast, config(2, 60));
        let t0 = Instant::now();
        fail_n(&breaker, 2, t0);

        for secs in [0, 1, 30, 59] {
            let err = breaker
                .try_acquire_at(t0 + Duration::from_secs(secs))
                .unwrap_err();
            assert!(matches!(err, FleetError::BackendUnavailable { backend: BackendId::Fast }));
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.snapshot_at(t0).rejected, 4);
        assert!(!breaker.allows_calls_at(t0 + Duration::from_secs(59)));
        assert!(breaker.allows_calls_at(t0 + Duration::from_secs(60)));
    }

    // ── Test 3: single probe after cooldown ──

    #[test]
    fn test_single_probe_in_half_open() {
        let breaker = CircuitBreaker::new(BackendId::Batch, config(1, 10));
        let t0 = Instant::now();
        fail_n(&breaker, 1, t0);

        let after = t0 + Duration::from_secs(10);
        let probe = breaker.try_acquire_at(after).unwrap();
        assert!(probe.is_probe());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Concurrent callers are turned away while the probe is in flight.
        assert!(breaker.try_acquire_at(after).is_err());
        assert!(breaker.try_acquire_at(after).is_err());

        probe.succeed();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot_at(after).consecutive_failures, 0);
        assert!(!breaker.try_acquire_at(after).unwrap().is_probe());
    }

    // ── Test 4: failed probe reopens with backoff ──

    #[test]
    fn test_failed_probe_reopens_with_backoff() {
        let breaker = CircuitBreaker::new(BackendId::Fast, config(1, 10));
        let t0 = Instant::now();
        fail_n(&breaker, 1, t0);

        let t1 = t0 + Duration::from_secs(10);
        breaker.try_acquire_at(t1).unwrap().fail_at(t1);
        assert_eq!(breaker.state(), CircuitState::Open);
        let snap = breaker.snapshot_at(t1);
        assert_eq!(snap.cooldown_ms, 20_000);
        assert_eq!(snap.opened_ms_ago, Some(0));

        // Fresh opened_at: the old cooldown no longer suffices.
        assert!(breaker.try_acquire_at(t1 + Duration::from_secs(10)).is_err());
        let probe = breaker.try_acquire_at(t1 + Duration::from_secs(20)).unwrap();
        probe.succeed();
        assert_eq!(breaker.snapshot_at(t1).cooldown_ms, 10_000);
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut cfg = config(1, 100);
        cfg.max_cooldown_secs = 150;
        let breaker = CircuitBreaker::new(BackendId::Fast, cfg);
        let mut now = Instant::now();
        fail_n(&breaker, 1, now);
        for _ in 0..3 {
            now += Duration::from_secs(1000);
            breaker.try_acquire_at(now).unwrap().fail_at(now);
        }
        assert_eq!(breaker.snapshot_at(now).cooldown_ms, 150_000);
    }

    // ── Test 5: success in closed resets the streak ──

    #[test]
    fn test_success_resets_streak() {
        let breaker = CircuitBreaker::new(BackendId::Fast, config(3, 60));
        let t0 = Instant::now();
        fail_n(&breaker, 2, t0);
        breaker.try_acquire_at(t0).unwrap().succeed();
        fail_n(&breaker, 2, t0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    // ── Test 6: idempotent under repeated failures ──

    #[test]
    fn test_repeated_failures_do_not_extend_open() {
        let breaker = CircuitBreaker::new(BackendId::Fast, config(2, 60));
        let t0 = Instant::now();
        // Two permits taken while closed; both fail after the circuit opened.
        let p1 = breaker.try_acquire_at(t0).unwrap();
        let p2 = breaker.try_acquire_at(t0).unwrap();
        let p3 = breaker.try_acquire_at(t0).unwrap();
        p1.fail_at(t0);
        p2.fail_at(t0);
        assert_eq!(breaker.state(), CircuitState::Open);
        p3.fail_at(t0 + Duration::from_secs(30));
        assert_eq!(breaker.snapshot_at(t0).trips, 1);
        assert!(breaker.try_acquire_at(t0 + Duration::from_secs(60)).is_ok());
    }

    // ── Test 7: abandoned permits count as failures ──

    #[test]
    fn test_dropped_permit_counts_as_failure() {
        let breaker = CircuitBreaker::new(BackendId::Fast, config(2, 60));
        drop(breaker.try_acquire().unwrap());
        drop(breaker.try_acquire().unwrap());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_released_probe_frees_slot() {
        let breaker = CircuitBreaker::new(BackendId::Fast, config(1, 5));
        let t0 = Instant::now();
        fail_n(&breaker, 1, t0);
        let later = t0 + Duration::from_secs(5);
        breaker.try_acquire_at(later).unwrap().release();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire_at(later).unwrap().is_probe());
    }

    #[test]
    fn test_reset_closes() {
        let breaker = CircuitBreaker::new(BackendId::Batch, config(1, 600));
        fail_n(&breaker, 1, Instant::now());
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allows_calls());
    }

    // ── Test 8: call() never reaches the backend while open ──

    #[tokio::test]
    async fn test_call_skips_backend_when_open() {
        let breaker = CircuitBreaker::new(BackendId::Fast, config(2, 3600));
        let calls = AtomicU32::new(0);

        for _ in 0..5 {
            let _ = breaker
                .call(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(FleetError::Backend {
                        backend: BackendId::Fast,
                        message: "boom".into(),
                    })
                })
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_call_over_capacity_is_neutral() {
        let breaker = CircuitBreaker::new(BackendId::Fast, config(1, 60));
        let res = breaker
            .call(|| async {
                Err::<(), _>(FleetError::OverCapacity {
                    backend: BackendId::Fast,
                })
            })
            .await;
        assert!(matches!(res, Err(FleetError::OverCapacity { .. })));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
