//! Per-route circuit breaker
//!
//! - `Closed` -> `Open` when failures in the rolling window reach the
//!   threshold, or when the window's failure rate reaches the configured rate
//! - `Open` -> `HalfOpen` on the first admission attempt after the cooldown
//! - `HalfOpen` -> `Closed` after `success_threshold` consecutive trial successes
//! - `HalfOpen` -> `Open` on any trial failure, restarting the cooldown
//!
//! Every admitted call carries a [`CallPermit`] stamped with the breaker's
//! epoch. Outcomes from an earlier epoch (a call admitted before the circuit
//! changed state) are ignored so trial accounting only sees trial calls.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use teller_common::{Clock, SystemClock, TellerError};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failures inside one window that open the circuit
    pub failure_threshold: u32,
    pub failure_window: Duration,
    /// Optional failure ratio (0.0..=1.0) that also opens the circuit
    pub failure_rate_threshold: Option<f64>,
    /// Calls required in the window before the failure rate is considered
    pub minimum_calls: u32,
    pub cooldown: Duration,
    /// Concurrent trial calls admitted while half-open
    pub half_open_max_calls: u32,
    /// Consecutive trial successes that close the circuit
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            failure_rate_threshold: None,
            minimum_calls: 10,
            cooldown: Duration::from_secs(30),
            half_open_max_calls: 1,
            success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold < 1 {
            return Err("failure_threshold must be >= 1".into());
        }
        if self.success_threshold < 1 {
            return Err("success_threshold must be >= 1".into());
        }
        if self.half_open_max_calls < 1 {
            return Err("half_open_max_calls must be >= 1".into());
        }
        if self.failure_window.is_zero() {
            return Err("failure_window must be > 0".into());
        }
        if let Some(rate) = self.failure_rate_threshold
            && !(rate > 0.0 && rate <= 1.0)
        {
            return Err("failure_rate_threshold must be in (0, 1]".into());
        }
        Ok(())
    }
}

/// Admission ticket returned by [`CircuitBreaker::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPermit {
    epoch: u64,
    trial: bool,
}

impl CallPermit {
    /// Whether this call is a half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

/// Point-in-time view of one circuit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub route_id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub call_count: u32,
    pub window_start: i64,
}

struct CircuitData {
    state: CircuitState,
    epoch: u64,
    failure_count: u32,
    call_count: u32,
    window_start: i64,
    opened_at: i64,
    trials_in_flight: u32,
    trial_successes: u32,
}

impl CircuitData {
    fn new(now: i64) -> Self {
        Self {
            state: CircuitState::Closed,
            epoch: 0,
            failure_count: 0,
            call_count: 0,
            window_start: now,
            opened_at: 0,
            trials_in_flight: 0,
            trial_successes: 0,
        }
    }

    fn transition(&mut self, to: CircuitState, now: i64) {
        self.state = to;
        self.epoch += 1;
        self.trials_in_flight = 0;
        self.trial_successes = 0;
        match to {
            CircuitState::Open => self.opened_at = now,
            CircuitState::Closed => {
                self.failure_count = 0;
                self.call_count = 0;
                self.window_start = now;
            }
            CircuitState::HalfOpen => {}
        }
    }
}

pub struct CircuitBreaker {
    route_id: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    data: Mutex<CircuitData>,
}

impl CircuitBreaker {
    pub fn new(route_id: impl Into<String>, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        Self {
            route_id: route_id.into(),
            config,
            clock,
            data: Mutex::new(CircuitData::new(now)),
        }
    }

    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask to run a call. Fails fast with `CircuitOpen` while open, or while
    /// half-open with all trial slots taken.
    pub fn try_acquire(&self) -> Result<CallPermit, TellerError> {
        let now = self.clock.now_millis();
        let mut data = self.data.lock();

        if data.state == CircuitState::Open {
            if now - data.opened_at < self.config.cooldown.as_millis() as i64 {
                return Err(TellerError::CircuitOpen(self.route_id.clone()));
            }
            data.transition(CircuitState::HalfOpen, now);
            info!(route = %self.route_id, "Circuit half-open, admitting trial calls");
        }

        match data.state {
            CircuitState::Closed => Ok(CallPermit {
                epoch: data.epoch,
                trial: false,
            }),
            CircuitState::HalfOpen if data.trials_in_flight < self.config.half_open_max_calls => {
                data.trials_in_flight += 1;
                Ok(CallPermit {
                    epoch: data.epoch,
                    trial: true,
                })
            }
            _ => Err(TellerError::CircuitOpen(self.route_id.clone())),
        }
    }

    /// Record a successful call.
    ///
    /// Returns `Some((from, to))` if a state transition occurred.
    pub fn record_success(&self, permit: CallPermit) -> Option<(CircuitState, CircuitState)> {
        let now = self.clock.now_millis();
        let mut data = self.data.lock();
        if permit.epoch != data.epoch {
            debug!(route = %self.route_id, "Ignoring success from a previous circuit epoch");
            return None;
        }

        match data.state {
            CircuitState::Closed => {
                self.roll_window(&mut data, now);
                data.call_count += 1;
                // Without a rate threshold failures must be consecutive
                if self.config.failure_rate_threshold.is_none() {
                    data.failure_count = 0;
                }
                None
            }
            CircuitState::HalfOpen => {
                data.trials_in_flight = data.trials_in_flight.saturating_sub(1);
                data.trial_successes += 1;
                if data.trial_successes >= self.config.success_threshold {
                    info!(
                        route = %self.route_id,
                        successes = data.trial_successes,
                        "Circuit closing after successful trial calls"
                    );
                    data.transition(CircuitState::Closed, now);
                    Some((CircuitState::HalfOpen, CircuitState::Closed))
                } else {
                    None
                }
            }
            CircuitState::Open => None,
        }
    }

    /// Record a failed call (error, transient upstream status or timeout).
    ///
    /// Returns `Some((from, to))` if a state transition occurred.
    pub fn record_failure(&self, permit: CallPermit) -> Option<(CircuitState, CircuitState)> {
        let now = self.clock.now_millis();
        let mut data = self.data.lock();
        if permit.epoch != data.epoch {
            debug!(route = %self.route_id, "Ignoring failure from a previous circuit epoch");
            return None;
        }

        match data.state {
            CircuitState::Closed => {
                self.roll_window(&mut data, now);
                data.call_count += 1;
                data.failure_count += 1;

                if self.should_open(&data) {
                    warn!(
                        route = %self.route_id,
                        failures = data.failure_count,
                        calls = data.call_count,
                        threshold = self.config.failure_threshold,
                        "Circuit opening"
                    );
                    data.transition(CircuitState::Open, now);
                    Some((CircuitState::Closed, CircuitState::Open))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                warn!(route = %self.route_id, "Circuit re-opening after trial failure");
                data.transition(CircuitState::Open, now);
                Some((CircuitState::HalfOpen, CircuitState::Open))
            }
            CircuitState::Open => None,
        }
    }

    /// Release a trial slot without recording an outcome (the call never ran).
    pub fn release(&self, permit: CallPermit) {
        let mut data = self.data.lock();
        if permit.trial && permit.epoch == data.epoch {
            data.trials_in_flight = data.trials_in_flight.saturating_sub(1);
        }
    }

    fn roll_window(&self, data: &mut CircuitData, now: i64) {
        if now - data.window_start >= self.config.failure_window.as_millis() as i64 {
            data.window_start = now;
            data.failure_count = 0;
            data.call_count = 0;
        }
    }

    fn should_open(&self, data: &CircuitData) -> bool {
        if data.failure_count >= self.config.failure_threshold {
            return true;
        }
        match self.config.failure_rate_threshold {
            Some(rate) if data.call_count >= self.config.minimum_calls.max(1) => {
                f64::from(data.failure_count) / f64::from(data.call_count) >= rate
            }
            _ => false,
        }
    }

    /// Stored state; an expired cooldown is only observed by `try_acquire`.
    pub fn state(&self) -> CircuitState {
        self.data.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let data = self.data.lock();
        CircuitSnapshot {
            route_id: self.route_id.clone(),
            state: data.state,
            failure_count: data.failure_count,
            call_count: data.call_count,
            window_start: data.window_start,
        }
    }

    /// Force the circuit back to `Closed`.
    pub fn reset(&self) {
        let now = self.clock.now_millis();
        self.data.lock().transition(CircuitState::Closed, now);
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data.lock();
        f.debug_struct("CircuitBreaker")
            .field("route_id", &self.route_id)
            .field("state", &data.state)
            .field("failure_count", &data.failure_count)
            .finish_non_exhaustive()
    }
}

/// Circuit breakers keyed by route id.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: DashMap::new(),
            clock,
        }
    }

    /// Breaker of a route, created with `config` on first use.
    pub fn get_or_create(&self, route_id: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(route_id) {
            return breaker.clone();
        }
        self.breakers
            .entry(route_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(route_id, config.clone(), self.clock.clone()))
            })
            .clone()
    }

    pub fn get(&self, route_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(route_id).map(|b| b.clone())
    }

    /// Snapshots of every breaker, sorted by route id.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<CircuitSnapshot> =
            self.breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.route_id.cmp(&b.route_id));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use teller_common::ManualClock;

    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            failure_window: Duration::from_secs(10),
            failure_rate_threshold: None,
            minimum_calls: 4,
            cooldown: Duration::from_secs(30),
            half_open_max_calls: 1,
            success_threshold: 2,
        }
    }

    fn breaker(config: CircuitBreakerConfig) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        (CircuitBreaker::new("card", config, clock.clone()), clock)
    }

    fn fail(cb: &CircuitBreaker) -> Option<(CircuitState, CircuitState)> {
        let permit = cb.try_acquire().unwrap();
        cb.record_failure(permit)
    }

    fn succeed(cb: &CircuitBreaker) -> Option<(CircuitState, CircuitState)> {
        let permit = cb.try_acquire().unwrap();
        cb.record_success(permit)
    }

    #[test]
    fn circuit_state_display() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
        assert_eq!(serde_json::to_string(&CircuitState::Open).unwrap(), "\"OPEN\"");
    }

    #[test]
    fn config_validation() {
        assert!(config().validate().is_ok());
        assert!(CircuitBreakerConfig { failure_threshold: 0, ..config() }.validate().is_err());
        assert!(CircuitBreakerConfig { half_open_max_calls: 0, ..config() }.validate().is_err());
        assert!(
            CircuitBreakerConfig { failure_rate_threshold: Some(1.5), ..config() }
                .validate()
                .is_err()
        );
    }

    #[test]
    fn opens_after_threshold_failures() {
        let (cb, _) = breaker(config());
        assert_eq!(fail(&cb), None);
        assert_eq!(fail(&cb), None);
        assert_eq!(fail(&cb), Some((CircuitState::Closed, CircuitState::Open)));
        assert_eq!(cb.state(), CircuitState::Open);

        assert!(matches!(cb.try_acquire(), Err(TellerError::CircuitOpen(route)) if route == "card"));
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let (cb, _) = breaker(config());
        fail(&cb);
        fail(&cb);
        succeed(&cb);
        fail(&cb);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn failures_outside_window_are_forgotten() {
        let (cb, clock) = breaker(config());
        fail(&cb);
        fail(&cb);
        clock.advance(Duration::from_secs(11));
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 1);
    }

    #[test]
    fn failure_rate_opens_circuit() {
        let (cb, _) = breaker(CircuitBreakerConfig {
            failure_threshold: 100,
            failure_rate_threshold: Some(0.5),
            ..config()
        });
        succeed(&cb);
        fail(&cb);
        succeed(&cb);
        // 2 of 4 calls failed, minimum calls reached
        assert_eq!(fail(&cb), Some((CircuitState::Closed, CircuitState::Open)));
    }

    #[test]
    fn stays_open_for_cooldown_then_half_opens() {
        let (cb, clock) = breaker(config());
        for _ in 0..3 {
            fail(&cb);
        }

        clock.advance(Duration::from_secs(29));
        assert!(cb.try_acquire().is_err());

        clock.advance(Duration::from_secs(1));
        let permit = cb.try_acquire().unwrap();
        assert!(permit.is_trial());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Only one trial slot
        assert!(cb.try_acquire().is_err());
        cb.record_success(permit);
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let permit = cb.try_acquire().unwrap();
        assert_eq!(
            cb.record_success(permit),
            Some((CircuitState::HalfOpen, CircuitState::Closed))
        );
        assert_eq!(cb.snapshot().failure_count, 0);
    }

    #[test]
    fn half_open_failure_reopens_and_restarts_cooldown() {
        let (cb, clock) = breaker(config());
        for _ in 0..3 {
            fail(&cb);
        }
        clock.advance(Duration::from_secs(30));

        assert_eq!(fail(&cb), Some((CircuitState::HalfOpen, CircuitState::Open)));
        clock.advance(Duration::from_secs(29));
        assert!(cb.try_acquire().is_err());
        clock.advance(Duration::from_secs(1));
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn stale_outcomes_are_ignored() {
        let (cb, clock) = breaker(config());
        let slow_call = cb.try_acquire().unwrap();
        for _ in 0..3 {
            fail(&cb);
        }
        clock.advance(Duration::from_secs(30));
        let trial = cb.try_acquire().unwrap();

        // A success from before the circuit opened must not count as a trial
        assert_eq!(cb.record_success(slow_call), None);
        assert_eq!(cb.record_success(trial), None);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn release_frees_trial_slot() {
        let (cb, clock) = breaker(config());
        for _ in 0..3 {
            fail(&cb);
        }
        clock.advance(Duration::from_secs(30));
        let trial = cb.try_acquire().unwrap();
        cb.release(trial);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn registry_reuses_breakers() {
        let registry = CircuitBreakerRegistry::with_clock(Arc::new(ManualClock::new(0)));
        let a = registry.get_or_create("card", &config());
        let b = registry.get_or_create("card", &CircuitBreakerConfig::default());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.config().failure_threshold, 3);

        registry.get_or_create("account", &config());
        let ids: Vec<String> = registry.snapshots().into_iter().map(|s| s.route_id).collect();
        assert_eq!(ids, vec!["account".to_string(), "card".to_string()]);
        assert!(registry.get("search").is_none());
    }
}
