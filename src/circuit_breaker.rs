//! Per-endpoint circuit breaker with three explicit states: Closed (normal),
//! Open (failing fast), and HalfOpen (probing for recovery).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time snapshot of a breaker's counters, exposed for diagnostics
/// and tests without taking the breaker's lock for the caller's duration.
#[derive(Debug, Clone)]
pub struct BreakerMetrics {
    pub state: BreakerState,
    pub failure_count: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_failure_at: Option<Instant>,
    pub state_entered_at: Instant,
    pub recent_transitions: Vec<(BreakerState, BreakerState)>,
}

const MAX_RECENT_TRANSITIONS: usize = 10;

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_attempts: u32,
    half_open_max_attempts: u32,
    opened_at: Option<Instant>,
    state_entered_at: Instant,
    threshold: u32,
    cooldown: Duration,
    total_successes: u64,
    total_failures: u64,
    last_failure_at: Option<Instant>,
    recent_transitions: Vec<(BreakerState, BreakerState)>,
}

impl BreakerInner {
    fn new(threshold: u32, cooldown: Duration, half_open_max_attempts: u32) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            half_open_attempts: 0,
            half_open_max_attempts,
            opened_at: None,
            state_entered_at: Instant::now(),
            threshold,
            cooldown,
            total_successes: 0,
            total_failures: 0,
            last_failure_at: None,
            recent_transitions: Vec::new(),
        }
    }

    fn transition(&mut self, to: BreakerState) {
        if self.recent_transitions.len() >= MAX_RECENT_TRANSITIONS {
            self.recent_transitions.remove(0);
        }
        self.recent_transitions.push((self.state, to));
        self.state = to;
        self.state_entered_at = Instant::now();
    }

    /// Returns whether a call should be attempted right now, transitioning
    /// Open → HalfOpen once the cooldown has elapsed.
    fn allow(&mut self) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if self.opened_at.map(|t| t.elapsed() >= self.cooldown).unwrap_or(false) {
                    self.transition(BreakerState::HalfOpen);
                    self.half_open_attempts = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&mut self) {
        self.total_successes += 1;
        match self.state {
            BreakerState::Closed => {
                self.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                self.half_open_attempts += 1;
                if self.half_open_attempts >= self.half_open_max_attempts {
                    self.transition(BreakerState::Closed);
                    self.consecutive_failures = 0;
                    self.half_open_attempts = 0;
                    self.opened_at = None;
                }
            }
            BreakerState::Open => {}
        }
    }

    fn record_failure(&mut self) {
        self.total_failures += 1;
        self.last_failure_at = Some(Instant::now());
        self.consecutive_failures += 1;
        match self.state {
            BreakerState::HalfOpen => {
                self.half_open_attempts = 0;
                self.transition(BreakerState::Open);
                self.opened_at = Some(Instant::now());
            }
            BreakerState::Closed if self.consecutive_failures >= self.threshold => {
                self.transition(BreakerState::Open);
                self.opened_at = Some(Instant::now());
            }
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.transition(BreakerState::Closed);
        self.consecutive_failures = 0;
        self.half_open_attempts = 0;
        self.opened_at = None;
    }

    fn metrics(&self) -> BreakerMetrics {
        BreakerMetrics {
            state: self.state,
            failure_count: self.consecutive_failures,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            last_failure_at: self.last_failure_at,
            state_entered_at: self.state_entered_at,
            recent_transitions: self.recent_transitions.clone(),
        }
    }
}

/// A single endpoint's breaker handle.
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration, half_open_max_attempts: u32) -> Self {
        Self { inner: Mutex::new(BreakerInner::new(threshold, cooldown, half_open_max_attempts)) }
    }

    pub fn allow(&self) -> bool {
        self.inner.lock().allow()
    }

    pub fn record_success(&self) {
        self.inner.lock().record_success();
    }

    pub fn record_failure(&self) {
        self.inner.lock().record_failure();
    }

    pub fn reset(&self) {
        self.inner.lock().reset();
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn metrics(&self) -> BreakerMetrics {
        self.inner.lock().metrics()
    }
}

/// Keeps one breaker per endpoint host, created lazily on first use.
pub struct GlobalCircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    half_open_max_attempts: u32,
    breakers: Mutex<HashMap<String, std::sync::Arc<CircuitBreaker>>>,
}

impl GlobalCircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration, half_open_max_attempts: u32) -> Self {
        Self { threshold, cooldown, half_open_max_attempts, breakers: Mutex::new(HashMap::new()) }
    }

    pub fn for_endpoint(&self, endpoint: &str) -> std::sync::Arc<CircuitBreaker> {
        let mut map = self.breakers.lock();
        map.entry(endpoint.to_string())
            .or_insert_with(|| {
                std::sync::Arc::new(CircuitBreaker::new(self.threshold, self.cooldown, self.half_open_max_attempts))
            })
            .clone()
    }
}
