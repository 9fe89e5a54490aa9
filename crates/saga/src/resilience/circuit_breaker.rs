//! Count-based circuit breaker.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failure rate (0.0 to 1.0) at or above which the breaker opens.
    pub failure_rate_threshold: f64,
    /// Number of most recent calls the failure rate is computed over.
    pub sliding_window_size: usize,
    /// Calls required in the window before the rate is evaluated.
    pub minimum_calls: usize,
    /// How long the breaker stays open before probing.
    pub open_duration: Duration,
    /// Probe calls permitted while half-open.
    pub half_open_max_calls: u32,
    /// How long the breaker may stay half-open without a verdict before it
    /// reopens and the cool-down starts over.
    pub half_open_max_wait: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            sliding_window_size: 10,
            minimum_calls: 5,
            open_duration: Duration::from_secs(30),
            half_open_max_calls: 3,
            half_open_max_wait: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a breaker, for inspection endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_rate: f64,
    pub buffered_calls: usize,
    pub failed_calls: usize,
    pub seconds_in_state: f64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Outcomes of recent calls while closed; `true` is a failure.
    window: VecDeque<bool>,
    half_open_permits: u32,
    half_open_successes: u32,
    since: Instant,
    /// Bumped on every state change so stale permits can be told apart.
    generation: u64,
}

impl BreakerInner {
    fn failures(&self) -> usize {
        self.window.iter().filter(|failed| **failed).count()
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.failures() as f64 / self.window.len() as f64
        }
    }

    fn move_to(&mut self, state: CircuitState, name: &str) {
        if self.state == state {
            return;
        }
        tracing::warn!(breaker = name, from = %self.state, to = %state, "circuit breaker state change");
        self.state = state;
        self.since = Instant::now();
        self.generation += 1;
        self.half_open_permits = 0;
        self.half_open_successes = 0;
        if state == CircuitState::Closed {
            self.window.clear();
        }
    }
}

/// Permission for one call, handed out by [`CircuitBreaker::try_acquire`].
///
/// Report the outcome with [`success`](Self::success) or
/// [`failure`](Self::failure). A permit dropped without an outcome, as when
/// the calling future is cancelled, gives its half-open probe slot back.
#[must_use = "report the call outcome on the permit"]
#[derive(Debug)]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    /// Breaker generation, when this permit is a half-open probe.
    probe: Option<u64>,
    settled: bool,
}

impl Permit<'_> {
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled
            && let Some(generation) = self.probe
        {
            self.breaker.return_probe(generation);
        }
    }
}

/// Circuit breaker guarding one downstream service.
///
/// Closed: calls pass and outcomes fill a sliding window. Once the window
/// holds `minimum_calls` outcomes and the failure rate reaches the
/// threshold, the breaker opens. Open: calls are refused until
/// `open_duration` has elapsed, then the breaker goes half-open and lets
/// `half_open_max_calls` probes through. All probes succeeding closes it;
/// any probe failing reopens it, and so does staying half-open longer than
/// `half_open_max_wait`.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                half_open_permits: 0,
                half_open_successes: 0,
                since: Instant::now(),
                generation: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Asks permission to make a call. Returns `None` while the breaker is
    /// open or all half-open probes are taken.
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut inner = self.lock();
        if inner.state == CircuitState::Open && inner.since.elapsed() >= self.config.open_duration
        {
            inner.move_to(CircuitState::HalfOpen, &self.name);
        } else if inner.state == CircuitState::HalfOpen
            && inner.since.elapsed() >= self.config.half_open_max_wait
        {
            tracing::warn!(breaker = %self.name, "no verdict while half-open, reopening");
            inner.move_to(CircuitState::Open, &self.name);
        }

        let probe = match inner.state {
            CircuitState::Closed => None,
            CircuitState::Open => return None,
            CircuitState::HalfOpen => {
                if inner.half_open_permits >= self.config.half_open_max_calls {
                    return None;
                }
                inner.half_open_permits += 1;
                Some(inner.generation)
            }
        };
        Some(Permit {
            breaker: self,
            probe,
            settled: false,
        })
    }

    fn return_probe(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && inner.generation == generation {
            inner.half_open_permits = inner.half_open_permits.saturating_sub(1);
            tracing::debug!(breaker = %self.name, "abandoned half-open probe returned");
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => self.push_outcome(&mut inner, false),
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_max_calls {
                    inner.move_to(CircuitState::Closed, &self.name);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                self.push_outcome(&mut inner, true);
                if inner.window.len() >= self.config.minimum_calls
                    && inner.failure_rate() >= self.config.failure_rate_threshold
                {
                    inner.move_to(CircuitState::Open, &self.name);
                }
            }
            CircuitState::HalfOpen => inner.move_to(CircuitState::Open, &self.name),
            CircuitState::Open => {}
        }
    }

    fn push_outcome(&self, inner: &mut BreakerInner, failed: bool) {
        inner.window.push_back(failed);
        while inner.window.len() > self.config.sliding_window_size {
            inner.window.pop_front();
        }
    }

    /// Current state. An open breaker past its cool-down still reports
    /// `Open` until the next call attempt moves it to half-open.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.lock();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_rate: inner.failure_rate(),
            buffered_calls: inner.window.len(),
            failed_calls: inner.failures(),
            seconds_in_state: inner.since.elapsed().as_secs_f64(),
        }
    }

    /// Forces the breaker back to closed with an empty window.
    pub fn reset(&self) {
        self.lock().move_to(CircuitState::Closed, &self.name);
    }
}
