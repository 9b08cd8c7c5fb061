//! Per-endpoint circuit breaker.
//!
//! ```text
//! Closed   --failure_threshold consecutive transient failures--> Open
//! Open     --reset_timeout elapsed-------------------------------> HalfOpen
//! HalfOpen --probe succeeds--------------------------------------> Closed
//! HalfOpen --probe fails-----------------------------------------> Open (openedAt reset)
//! ```
//!
//! Callers acquire a [`BreakerPermit`] before calling the endpoint and settle
//! it exactly once with the classified outcome. In HalfOpen only one permit
//! (the probe) is handed out; the `probe_in_flight` flag is claimed with a
//! compare-and-swap and every other caller is rejected as if Open.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{BreakerConfig, EngineConfig};
use crate::error::CallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure: Option<Instant>,
    /// When an Open circuit will admit a probe.
    pub reset_deadline: Option<Instant>,
    pub probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    endpoint: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    probe_in_flight: AtomicBool,
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                opened_at: None,
            }),
            probe_in_flight: AtomicBool::new(false),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_error(&self, retry_in: Duration) -> CallError {
        CallError::CircuitOpen {
            endpoint: self.endpoint.clone(),
            retry_in,
        }
    }

    /// Ask to place a call. Fails fast with `CircuitOpen` while open, and for
    /// every caller but the probe while half-open.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, CallError> {
        let now = Instant::now();
        let mut inner = self.lock();

        if inner.state == CircuitState::Open {
            let deadline = inner
                .opened_at
                .map(|t| t + self.config.reset_timeout())
                .unwrap_or(now);
            if now < deadline {
                return Err(self.open_error(deadline - now));
            }
            inner.state = CircuitState::HalfOpen;
            info!(endpoint = %self.endpoint, "circuit half-open, admitting probe");
        }

        match inner.state {
            CircuitState::Closed => Ok(BreakerPermit::new(self, false)),
            CircuitState::HalfOpen => {
                if self
                    .probe_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    Ok(BreakerPermit::new(self, true))
                } else {
                    Err(self.open_error(Duration::ZERO))
                }
            }
            CircuitState::Open => Err(self.open_error(self.config.reset_timeout())),
        }
    }

    /// Only the half-open trial call closes a tripped circuit. A permit handed
    /// out while Closed may settle after the trip; it leaves Open/HalfOpen alone.
    fn on_success(&self, probe: bool) {
        let mut inner = self.lock();
        if probe {
            inner.consecutive_failures = 0;
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            info!(endpoint = %self.endpoint, "circuit closed");
        } else if inner.state == CircuitState::Closed {
            inner.consecutive_failures = 0;
        }
        drop(inner);
        if probe {
            self.probe_in_flight.store(false, Ordering::Release);
        }
    }

    fn on_failure(&self, probe: bool) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(now);

        let trip = if probe {
            true
        } else {
            inner.state == CircuitState::Closed
                && inner.consecutive_failures >= self.config.failure_threshold
        };
        if trip {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            warn!(
                endpoint = %self.endpoint,
                failures = inner.consecutive_failures,
                reset_ms = self.config.reset_timeout_ms,
                "circuit opened"
            );
        }
        drop(inner);
        if probe {
            self.probe_in_flight.store(false, Ordering::Release);
        }
    }

    fn on_release(&self, probe: bool) {
        if probe {
            self.probe_in_flight.store(false, Ordering::Release);
        }
    }

    pub fn state(&self) -> CircuitState {
        self.snapshot().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure: inner.last_failure,
            reset_deadline: match inner.state {
                CircuitState::Open => inner.opened_at.map(|t| t + self.config.reset_timeout()),
                _ => None,
            },
            probe_in_flight: self.probe_in_flight.load(Ordering::Acquire),
        }
    }
}

/// Right to place one call. Settle it with [`succeed`](Self::succeed),
/// [`fail`](Self::fail) or [`release`](Self::release); dropping it
/// unsettled behaves like `release`.
#[derive(Debug)]
#[must_use = "a permit must be settled with the call outcome"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// The call succeeded.
    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    /// The call failed transiently; counts toward the threshold.
    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }

    /// No verdict on the target (non-transient rejection, cancellation).
    pub fn release(mut self) {
        self.settled = true;
        self.breaker.on_release(self.probe);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_release(self.probe);
        }
    }
}

/// Explicit registry of breakers, one per endpoint, shared by every run.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: EngineConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            config: config.clone(),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        if let Some(b) = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
        {
            return b.clone();
        }
        let config = self.config.breaker_for(endpoint).clone();
        self.breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(endpoint, config)))
            .clone()
    }

    pub fn snapshot(&self) -> Vec<(String, CircuitSnapshot)> {
        let map = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = map
            .iter()
            .map(|(k, b)| (k.clone(), b.snapshot()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "http://target",
            BreakerConfig {
                failure_threshold: threshold,
                reset_timeout_ms: reset_ms,
            },
        )
    }

    fn fail_once(b: &CircuitBreaker) {
        b.try_acquire().expect("closed").fail();
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_consecutive_failures() {
        let b = breaker(3, 1_000);
        fail_once(&b);
        fail_once(&b);
        assert_eq!(b.state(), CircuitState::Closed);
        fail_once(&b);
        assert_eq!(b.state(), CircuitState::Open);

        match b.try_acquire() {
            Err(CallError::CircuitOpen { retry_in, .. }) => {
                assert_eq!(retry_in, Duration::from_millis(1_000))
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        };
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_consecutive_count() {
        let b = breaker(2, 1_000);
        fail_once(&b);
        b.try_acquire().unwrap().succeed();
        fail_once(&b);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn released_permits_do_not_count() {
        let b = breaker(1, 1_000);
        b.try_acquire().unwrap().release();
        {
            let _dropped = b.try_acquire().unwrap();
        }
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_single_probe_then_closes() {
        let b = breaker(1, 500);
        fail_once(&b);
        assert!(b.try_acquire().is_err());

        tokio::time::advance(Duration::from_millis(500)).await;
        let probe = b.try_acquire().expect("probe admitted");
        assert!(probe.is_probe());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(matches!(b.try_acquire(), Err(CallError::CircuitOpen { .. })));

        probe.succeed();
        assert_eq!(b.state(), CircuitState::Closed);
        let permit = b.try_acquire().unwrap();
        assert!(!permit.is_probe());
        permit.succeed();
    }

    #[tokio::test(start_paused = true)]
    async fn late_success_from_closed_permit_does_not_close_half_open() {
        let b = breaker(1, 100);
        let late = b.try_acquire().unwrap();
        assert!(!late.is_probe());
        fail_once(&b);
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(100)).await;
        let trial = b.try_acquire().expect("half-open trial admitted");
        assert!(trial.is_probe());

        late.succeed();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(matches!(b.try_acquire(), Err(CallError::CircuitOpen { .. })));

        trial.succeed();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn late_success_while_open_keeps_circuit_open() {
        let b = breaker(1, 1_000);
        let late = b.try_acquire().unwrap();
        fail_once(&b);
        late.succeed();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(b.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens_with_fresh_timer() {
        let b = breaker(1, 500);
        fail_once(&b);
        tokio::time::advance(Duration::from_millis(600)).await;
        b.try_acquire().unwrap().fail();
        assert_eq!(b.state(), CircuitState::Open);

        let snap = b.snapshot();
        assert_eq!(
            snap.reset_deadline,
            Some(Instant::now() + Duration::from_millis(500))
        );
        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(b.try_acquire().is_err());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(b.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn released_probe_lets_next_caller_probe() {
        let b = breaker(1, 100);
        fail_once(&b);
        tokio::time::advance(Duration::from_millis(100)).await;
        let probe = b.try_acquire().unwrap();
        drop(probe);
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(b.try_acquire().unwrap().is_probe());
    }

    #[test]
    fn concurrent_half_open_callers_get_exactly_one_probe() {
        let b = Arc::new(breaker(1, 1));
        fail_once(&b);
        std::thread::sleep(Duration::from_millis(5));

        let barrier = Arc::new(std::sync::Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let b = b.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    let admitted = match b.try_acquire() {
                        Ok(permit) => {
                            let probe = permit.is_probe();
                            if probe {
                                // Hold the probe until everyone has tried.
                                std::thread::sleep(Duration::from_millis(50));
                            }
                            permit.succeed();
                            i32::from(probe)
                        }
                        Err(CallError::CircuitOpen { .. }) => 0,
                        Err(e) => panic!("unexpected {e:?}"),
                    };
                    admitted
                })
            })
            .collect();
        let probes: i32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(probes, 1);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn registry_returns_one_breaker_per_endpoint() {
        let mut cfg = EngineConfig::default();
        cfg.breaker_overrides.insert(
            "http://b".into(),
            BreakerConfig {
                failure_threshold: 1,
                reset_timeout_ms: 10,
            },
        );
        let reg = BreakerRegistry::new(&cfg);
        let a1 = reg.get("http://a");
        let a2 = reg.get("http://a");
        assert!(Arc::ptr_eq(&a1, &a2));

        reg.get("http://b").try_acquire().unwrap().fail();
        assert_eq!(reg.get("http://b").state(), CircuitState::Open);
        assert_eq!(reg.get("http://a").state(), CircuitState::Closed);
        assert_eq!(reg.snapshot().len(), 2);
    }
}
