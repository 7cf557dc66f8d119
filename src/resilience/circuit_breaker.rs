//! Circuit breaker primitive and registry.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: dependency assumed down, requests fail fast
//! - Half-Open: a limited number of trial calls test recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure rate >= threshold over the sliding window
//! Open → Half-Open: after wait_duration_in_open_state
//! Half-Open → Closed: every permitted trial call succeeds
//! Half-Open → Open: any trial call fails
//! ```
//!
//! # Design Decisions
//! - Named breakers, created lazily and shared by every request with that name
//! - Permission is never queued: allow or deny immediately
//! - One short critical section per call keeps updates consistent

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::{BreakerSettings, CircuitBreakerConfig};

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "CLOSED"),
            BreakerState::Open => write!(f, "OPEN"),
            BreakerState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Admission-control primitive consulted by the gate.
pub trait CircuitBreaker: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Returns true if the call may proceed. Never blocks.
    fn try_acquire_permission(&self) -> bool;

    /// Record a permitted call that completed normally.
    fn on_success(&self, elapsed: Duration);

    /// Record a permitted call that failed.
    fn on_error(&self, elapsed: Duration);

    /// Return a permission whose call never completed (e.g. it was cancelled).
    fn release_permission(&self) {}

    fn state(&self) -> BreakerState;
}

/// Source of breakers keyed by name.
pub trait BreakerRegistry: Send + Sync + fmt::Debug {
    /// Return the breaker for `name`, creating it on first use.
    fn breaker(&self, name: &str) -> Arc<dyn CircuitBreaker>;

    /// Current state of every breaker created so far.
    fn states(&self) -> Vec<(String, BreakerState)>;
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    /// Last outcomes in the closed state, `true` for failure.
    window: VecDeque<bool>,
    failures: usize,
    opened_at: Option<Instant>,
    trials_issued: usize,
    trial_successes: usize,
}

/// Count-based sliding-window breaker.
#[derive(Debug)]
pub struct CountBasedBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
}

impl CountBasedBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                window: VecDeque::with_capacity(settings.sliding_window_size),
                failures: 0,
                opened_at: None,
                trials_issued: 0,
                trial_successes: 0,
            }),
            settings,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // A panic while holding the lock leaves counters usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait_duration(&self) -> Duration {
        Duration::from_millis(self.settings.wait_duration_in_open_state_ms)
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) {
        let from = inner.state;
        inner.state = to;
        match to {
            BreakerState::Open => {
                inner.opened_at = Some(Instant::now());
                tracing::warn!(breaker = %self.name, from = %from, "Circuit breaker opened");
            }
            BreakerState::HalfOpen => {
                inner.trials_issued = 0;
                inner.trial_successes = 0;
                tracing::info!(breaker = %self.name, "Circuit breaker half-open, admitting trial calls");
            }
            BreakerState::Closed => {
                inner.window.clear();
                inner.failures = 0;
                inner.opened_at = None;
                tracing::info!(breaker = %self.name, "Circuit breaker closed");
            }
        }
    }

    fn record(&self, failed: bool) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.window.push_back(failed);
                if failed {
                    inner.failures += 1;
                }
                if inner.window.len() > self.settings.sliding_window_size {
                    if inner.window.pop_front() == Some(true) {
                        inner.failures -= 1;
                    }
                }

                let calls = inner.window.len();
                let minimum = self
                    .settings
                    .minimum_number_of_calls
                    .min(self.settings.sliding_window_size);
                if calls >= minimum {
                    let rate = inner.failures as f32 * 100.0 / calls as f32;
                    if rate >= self.settings.failure_rate_threshold {
                        self.transition(&mut inner, BreakerState::Open);
                    }
                }
            }
            BreakerState::HalfOpen => {
                if failed {
                    self.transition(&mut inner, BreakerState::Open);
                } else {
                    inner.trial_successes += 1;
                    if inner.trial_successes >= self.settings.permitted_calls_in_half_open_state {
                        self.transition(&mut inner, BreakerState::Closed);
                    }
                }
            }
            // Late outcome of a call admitted before the breaker opened.
            BreakerState::Open => {}
        }
    }
}

impl CircuitBreaker for CountBasedBreaker {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_acquire_permission(&self) -> bool {
        let mut inner = self.lock();

        if inner.state == BreakerState::Open {
            let waited = inner
                .opened_at
                .map_or(true, |at| at.elapsed() >= self.wait_duration());
            if !waited {
                return false;
            }
            self.transition(&mut inner, BreakerState::HalfOpen);
        }

        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => {
                if inner.trials_issued < self.settings.permitted_calls_in_half_open_state {
                    inner.trials_issued += 1;
                    true
                } else {
                    false
                }
            }
            BreakerState::Open => false,
        }
    }

    fn on_success(&self, _elapsed: Duration) {
        self.record(false);
    }

    fn on_error(&self, _elapsed: Duration) {
        self.record(true);
    }

    fn release_permission(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.trials_issued = inner.trials_issued.saturating_sub(1);
        }
    }

    fn state(&self) -> BreakerState {
        self.lock().state
    }
}

/// In-process registry of [`CountBasedBreaker`]s.
#[derive(Debug)]
pub struct InMemoryBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CountBasedBreaker>>,
}

impl InMemoryBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }
}

impl BreakerRegistry for InMemoryBreakerRegistry {
    fn breaker(&self, name: &str) -> Arc<dyn CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(breaker = %name, "Creating circuit breaker");
                Arc::new(CountBasedBreaker::new(name, self.config.settings_for(name).clone()))
            })
            .clone()
    }

    fn states(&self) -> Vec<(String, BreakerState)> {
        let mut states: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(wait_ms: u64) -> BreakerSettings {
        BreakerSettings {
            failure_rate_threshold: 50.0,
            sliding_window_size: 4,
            minimum_number_of_calls: 4,
            wait_duration_in_open_state_ms: wait_ms,
            permitted_calls_in_half_open_state: 2,
        }
    }

    fn call(breaker: &CountBasedBreaker, fail: bool) {
        assert!(breaker.try_acquire_permission());
        if fail {
            breaker.on_error(Duration::from_millis(1));
        } else {
            breaker.on_success(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_stays_closed_below_minimum_calls() {
        let breaker = CountBasedBreaker::new("b", settings(60_000));
        for _ in 0..3 {
            call(&breaker, true);
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_opens_at_threshold() {
        let breaker = CountBasedBreaker::new("b", settings(60_000));
        call(&breaker, false);
        call(&breaker, false);
        call(&breaker, true);
        call(&breaker, true);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.try_acquire_permission());
    }

    #[test]
    fn test_window_slides() {
        let breaker = CountBasedBreaker::new("b", settings(60_000));
        call(&breaker, true);
        for _ in 0..6 {
            call(&breaker, false);
        }
        // The early failure has left the window.
        call(&breaker, true);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_recovers() {
        let breaker = CountBasedBreaker::new("b", settings(0));
        for _ in 0..4 {
            call(&breaker, true);
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        assert!(breaker.try_acquire_permission());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.try_acquire_permission());
        assert!(!breaker.try_acquire_permission(), "trial budget exhausted");

        breaker.on_success(Duration::ZERO);
        breaker.on_success(Duration::ZERO);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_trial_failure_reopens() {
        let breaker = CountBasedBreaker::new("b", settings(0));
        for _ in 0..4 {
            call(&breaker, true);
        }
        assert!(breaker.try_acquire_permission());
        breaker.on_error(Duration::ZERO);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_released_trial_can_be_reissued() {
        let breaker = CountBasedBreaker::new("b", settings(0));
        for _ in 0..4 {
            call(&breaker, true);
        }
        assert!(breaker.try_acquire_permission());
        assert!(breaker.try_acquire_permission());
        assert!(!breaker.try_acquire_permission());

        breaker.release_permission();
        assert!(breaker.try_acquire_permission());
    }

    #[test]
    fn test_open_waits_before_probing() {
        let breaker = CountBasedBreaker::new("b", settings(50));
        for _ in 0..4 {
            call(&breaker, true);
        }
        assert!(!breaker.try_acquire_permission());
        std::thread::sleep(Duration::from_millis(80));
        assert!(breaker.try_acquire_permission());
    }

    #[test]
    fn test_registry_shares_instances() {
        let mut config = CircuitBreakerConfig::default();
        config.instances.insert("jwks".into(), settings(1_000));
        let registry = InMemoryBreakerRegistry::new(config);

        let a = registry.breaker("jwks");
        let b = registry.breaker("jwks");
        for _ in 0..4 {
            assert!(a.try_acquire_permission());
            a.on_error(Duration::ZERO);
        }
        assert_eq!(b.state(), BreakerState::Open);

        assert_eq!(registry.breaker("default").state(), BreakerState::Closed);
        assert_eq!(
            registry.states(),
            vec![
                ("default".to_string(), BreakerState::Closed),
                ("jwks".to_string(), BreakerState::Open),
            ]
        );
    }

    #[test]
    fn test_concurrent_failures_are_all_counted() {
        // Opens only once every one of the 201 failures is in the window.
        let breaker = Arc::new(CountBasedBreaker::new(
            "shared",
            BreakerSettings {
                failure_rate_threshold: 100.0,
                sliding_window_size: 256,
                minimum_number_of_calls: 201,
                ..settings(60_000)
            },
        ));

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let breaker = &breaker;
                scope.spawn(move || {
                    for _ in 0..25 {
                        assert!(breaker.try_acquire_permission());
                        breaker.on_error(Duration::ZERO);
                    }
                });
            }
        });
        assert_eq!(breaker.state(), BreakerState::Closed);

        call(&breaker, true);
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
