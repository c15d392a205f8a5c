//! Circuit breaker protecting the cross-encoder tier.
//!
//! A small closed/open/half-open state machine with cooldowns and status
//! reporting. Breakers are plain values; [`SharedCircuitBreaker`] wraps one in
//! `Arc<Mutex<_>>` so concurrent requests observe the same failure counters.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Number of consecutive successful probes required to close from half-open.
    pub success_threshold: u32,
    /// How long the circuit stays open before admitting a probe.
    pub recovery_timeout: Duration,
}

impl CircuitBreakerConfig {
    /// Create a new configuration. Thresholds are raised to at least 1.
    #[must_use]
    pub fn new(failure_threshold: u32, success_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            recovery_timeout,
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed,
    Open { since: Instant },
    /// Cooldown elapsed; probes run one at a time.
    Probing { passed: u32, in_flight: bool },
}

impl Phase {
    fn kind(self) -> CircuitStateKind {
        match self {
            Self::Closed => CircuitStateKind::Closed,
            Self::Open { .. } => CircuitStateKind::Open,
            Self::Probing { .. } => CircuitStateKind::HalfOpen,
        }
    }
}

/// Circuit state as reported outside the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of a breaker, for health endpoints and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub name: String,
    pub state: CircuitStateKind,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub open_for_ms: Option<u64>,
    pub cooldown_remaining_ms: Option<u64>,
    pub half_open_successes: Option<u32>,
}

/// Closed/open/half-open state machine counting consecutive failures.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    phase: Phase,
    failures: u32,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_name("cross_encoder", config)
    }

    /// `name` appears as the `circuit` field in logs and status snapshots.
    #[must_use]
    pub fn with_name(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            phase: Phase::Closed,
            failures: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether the protected call may run now.
    ///
    /// Once the cooldown has elapsed the breaker admits a single probe and
    /// rejects everything else until that probe reports back.
    pub fn allow(&mut self) -> bool {
        match self.phase {
            Phase::Closed => true,
            Phase::Open { since } if since.elapsed() >= self.config.recovery_timeout => {
                self.phase = Phase::Probing {
                    passed: 0,
                    in_flight: true,
                };
                info!(circuit = %self.name, "Cooldown elapsed; admitting probe");
                true
            }
            Phase::Open { .. } | Phase::Probing { in_flight: true, .. } => false,
            Phase::Probing {
                passed,
                in_flight: false,
            } => {
                self.phase = Phase::Probing {
                    passed,
                    in_flight: true,
                };
                true
            }
        }
    }

    pub fn record_success(&mut self) {
        match self.phase {
            Phase::Closed => self.failures = 0,
            Phase::Probing { passed, .. } if passed + 1 >= self.config.success_threshold => {
                self.reset();
            }
            Phase::Probing { passed, .. } => {
                self.phase = Phase::Probing {
                    passed: passed + 1,
                    in_flight: false,
                };
            }
            // Admitted before the circuit tripped; the cooldown keeps running.
            Phase::Open { .. } => {}
        }
    }

    pub fn record_failure(&mut self) {
        match self.phase {
            Phase::Closed => {
                self.failures = self.failures.saturating_add(1);
                if self.failures >= self.config.failure_threshold {
                    self.trip();
                } else {
                    debug!(circuit = %self.name, failures = self.failures, "Failure recorded");
                }
            }
            Phase::Probing { .. } => {
                self.failures = self.failures.saturating_add(1);
                self.trip();
            }
            Phase::Open { .. } => {}
        }
    }

    /// An admitted call ended without an outcome (its caller was dropped).
    ///
    /// The half-open slot is freed so the next caller can run the trial. Failure
    /// counters are left alone.
    pub fn abandon(&mut self) {
        if let Phase::Probing {
            passed,
            in_flight: true,
        } = self.phase
        {
            self.phase = Phase::Probing {
                passed,
                in_flight: false,
            };
            debug!(circuit = %self.name, "Trial call abandoned; slot released");
        }
    }

    #[must_use]
    pub fn state(&self) -> CircuitStateKind {
        self.phase.kind()
    }

    #[must_use]
    pub fn status(&self) -> CircuitBreakerStatus {
        let (open_for_ms, cooldown_remaining_ms, half_open_successes) = match self.phase {
            Phase::Closed => (None, None, None),
            Phase::Open { since } => {
                let open_for = since.elapsed();
                let remaining = self.config.recovery_timeout.checked_sub(open_for);
                (Some(millis(open_for)), remaining.map(millis), None)
            }
            Phase::Probing { passed, .. } => (None, None, Some(passed)),
        };
        CircuitBreakerStatus {
            name: self.name.clone(),
            state: self.state(),
            consecutive_failures: self.failures,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            recovery_timeout_ms: millis(self.config.recovery_timeout),
            open_for_ms,
            cooldown_remaining_ms,
            half_open_successes,
        }
    }

    fn trip(&mut self) {
        self.phase = Phase::Open {
            since: Instant::now(),
        };
        warn!(
            circuit = %self.name,
            failures = self.failures,
            threshold = self.config.failure_threshold,
            cooldown_ms = millis(self.config.recovery_timeout),
            "Circuit opened"
        );
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.phase = Phase::Closed;
        info!(circuit = %self.name, "Circuit closed");
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Outcome of a call routed through a [`SharedCircuitBreaker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitCallError<E> {
    /// Rejected without invoking the operation.
    Open(String),
    /// The operation ran and failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for CircuitCallError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open(name) => write!(f, "circuit breaker `{name}` is open"),
            Self::Inner(err) => write!(f, "{err}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for CircuitCallError<E> {}

/// Admission to run one protected call.
///
/// Settle it with [`CircuitPermit::success`] or [`CircuitPermit::failure`].
/// Dropping it unsettled (a cancelled future, a panic) releases the slot
/// through [`CircuitBreaker::abandon`].
#[derive(Debug)]
#[must_use = "an unsettled permit is released as abandoned"]
pub struct CircuitPermit {
    breaker: SharedCircuitBreaker,
    settled: bool,
}

impl CircuitPermit {
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.lock().abandon();
        }
    }
}

/// A circuit breaker shared across concurrent requests.
///
/// Clones share state. A poisoned lock is recovered.
#[derive(Debug, Clone)]
pub struct SharedCircuitBreaker {
    inner: Arc<Mutex<CircuitBreaker>>,
}

impl SharedCircuitBreaker {
    #[must_use]
    pub fn new(breaker: CircuitBreaker) -> Self {
        Self {
            inner: Arc::new(Mutex::new(breaker)),
        }
    }

    #[must_use]
    pub fn from_config(config: CircuitBreakerConfig) -> Self {
        Self::new(CircuitBreaker::new(config))
    }

    fn lock(&self) -> MutexGuard<'_, CircuitBreaker> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> String {
        self.lock().name().to_string()
    }

    pub fn allow(&self) -> bool {
        self.lock().allow()
    }

    /// Admit one call, or `None` while the circuit rejects.
    pub fn try_acquire(&self) -> Option<CircuitPermit> {
        self.allow().then(|| CircuitPermit {
            breaker: self.clone(),
            settled: false,
        })
    }

    pub fn record_success(&self) {
        self.lock().record_success();
    }

    pub fn record_failure(&self) {
        self.lock().record_failure();
    }

    #[must_use]
    pub fn state(&self) -> CircuitStateKind {
        self.lock().state()
    }

    #[must_use]
    pub fn status(&self) -> CircuitBreakerStatus {
        self.lock().status()
    }

    /// Run `op` if the circuit allows it and record its outcome.
    pub fn call<T, E>(&self, op: impl FnOnce() -> Result<T, E>) -> Result<T, CircuitCallError<E>> {
        let Some(permit) = self.try_acquire() else {
            return Err(CircuitCallError::Open(self.name()));
        };
        match op() {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(err) => {
                permit.failure();
                Err(CircuitCallError::Inner(err))
            }
        }
    }
}

impl Default for SharedCircuitBreaker {
    fn default() -> Self {
        Self::from_config(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_at_failure_threshold() {
        let mut breaker =
            CircuitBreaker::new(CircuitBreakerConfig::new(2, 1, Duration::from_secs(10)));

        assert!(breaker.allow());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitStateKind::Closed);

        breaker.record_failure();
        let status = breaker.status();
        assert_eq!(status.state, CircuitStateKind::Open);
        assert!(status.cooldown_remaining_ms.is_some());
        assert!(!breaker.allow());
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let mut breaker =
            CircuitBreaker::new(CircuitBreakerConfig::new(3, 1, Duration::from_secs(10)));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitStateKind::Closed);
    }

    #[test]
    fn successful_probe_closes() {
        let mut breaker =
            CircuitBreaker::new(CircuitBreakerConfig::new(1, 1, Duration::from_millis(0)));

        breaker.record_failure();
        // Zero cooldown: the next allow() is the probe.
        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitStateKind::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitStateKind::Closed);
        assert_eq!(breaker.status().consecutive_failures, 0);
    }

    #[test]
    fn failed_probe_reopens() {
        let mut breaker =
            CircuitBreaker::new(CircuitBreakerConfig::new(1, 2, Duration::from_millis(0)));

        breaker.record_failure();
        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitStateKind::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitStateKind::Open);
    }

    #[test]
    fn half_open_admits_one_probe() {
        let mut breaker =
            CircuitBreaker::new(CircuitBreakerConfig::new(1, 2, Duration::from_millis(0)));
        breaker.record_failure();

        assert!(breaker.allow());
        assert!(!breaker.allow());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitStateKind::HalfOpen);
        assert!(breaker.allow());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitStateKind::Closed);
    }

    #[test]
    fn dropped_permit_frees_the_half_open_slot() {
        let breaker = SharedCircuitBreaker::from_config(CircuitBreakerConfig::new(
            1,
            1,
            Duration::from_millis(0),
        ));
        breaker.record_failure();

        let trial = breaker.try_acquire().unwrap();
        assert!(breaker.try_acquire().is_none());
        drop(trial);

        assert_eq!(breaker.state(), CircuitStateKind::HalfOpen);
        assert_eq!(breaker.status().consecutive_failures, 1);
        breaker.try_acquire().unwrap().success();
        assert_eq!(breaker.state(), CircuitStateKind::Closed);
    }

    #[test]
    fn dropped_permit_in_closed_state_is_neutral() {
        let breaker = SharedCircuitBreaker::from_config(CircuitBreakerConfig::new(
            1,
            1,
            Duration::from_secs(60),
        ));
        drop(breaker.try_acquire().unwrap());
        assert_eq!(breaker.state(), CircuitStateKind::Closed);
        assert_eq!(breaker.status().consecutive_failures, 0);
    }

    #[test]
    fn thresholds_are_at_least_one() {
        let config = CircuitBreakerConfig::new(0, 0, Duration::ZERO);
        assert_eq!(config.failure_threshold, 1);
        assert_eq!(config.success_threshold, 1);
    }

    #[test]
    fn shared_call_rejects_without_invoking_when_open() {
        let breaker = SharedCircuitBreaker::from_config(CircuitBreakerConfig::new(
            1,
            1,
            Duration::from_secs(60),
        ));
        let first: Result<(), _> = breaker.call(|| Err::<(), _>("boom"));
        assert_eq!(first, Err(CircuitCallError::Inner("boom")));

        let mut invoked = false;
        let second = breaker.call(|| {
            invoked = true;
            Ok::<_, &str>(1)
        });
        assert!(!invoked);
        assert!(matches!(second, Err(CircuitCallError::Open(_))));
    }

    #[test]
    fn clones_share_state() {
        let a = SharedCircuitBreaker::from_config(CircuitBreakerConfig::new(
            1,
            1,
            Duration::from_secs(60),
        ));
        let b = a.clone();
        a.record_failure();
        assert_eq!(b.state(), CircuitStateKind::Open);
    }

    #[test]
    fn status_serializes_snake_case() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
        let json = serde_json::to_value(breaker.status()).unwrap();
        assert_eq!(json["state"], "closed");
        assert_eq!(json["failure_threshold"], 5);
        assert_eq!(json["recovery_timeout_ms"], 30_000);
    }
}
