//! Circuit breaker state machine, keyed by task-ref
//!
//! One breaker per task-ref lives behind a `DashMap` sharded lock table, with
//! a `parking_lot::Mutex` guarding each entry's transitions so a
//! `try_acquire`/`record_success`/`record_failure` sequence for a given
//! task-ref is always atomic, matching the "all transitions are atomic under
//! a per-task-ref lock" requirement without a single global lock.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// `{failureThreshold, breakDuration, halfOpenRequests, samplingDuration}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "crate::reliability::retry::duration_millis")]
    pub break_duration: Duration,
    pub half_open_requests: u32,
    #[serde(with = "crate::reliability::retry::duration_millis")]
    pub sampling_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            break_duration: Duration::from_secs(30),
            half_open_requests: 1,
            sampling_duration: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = n.max(1);
        self
    }

    pub fn with_break_duration(mut self, d: Duration) -> Self {
        self.break_duration = d;
        self
    }

    pub fn with_half_open_requests(mut self, n: u32) -> Self {
        self.half_open_requests = n.max(1);
        self
    }

    pub fn with_sampling_duration(mut self, d: Duration) -> Self {
        self.sampling_duration = d;
        self
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

/// Whether an invocation may proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// Immutable point-in-time copy of a breaker's state, returned by
/// [`CircuitBreakerRegistry::snapshot`]. Never a live reference: callers
/// cannot observe torn reads across a concurrent transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerSnapshot {
    pub task_ref: String,
    pub state: CircuitState,
    pub failures_in_window: usize,
    pub half_open_successes: u32,
}

struct Inner {
    state: CircuitState,
    failure_window: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_successes: u32,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_window: VecDeque::new(),
            opened_at: None,
            half_open_successes: 0,
        }
    }

    fn prune_window(&mut self, config: &CircuitBreakerConfig, now: Instant) {
        while let Some(&front) = self.failure_window.front() {
            if now.duration_since(front) > config.sampling_duration {
                self.failure_window.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Sharded table of per-task-ref circuit breakers
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Mutex<Inner>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate and, if in `Open` state past `break_duration`, transition to
    /// `HalfOpen` before deciding. Matches "after breakDuration elapsed, next
    /// CanExecute transitions → HalfOpen".
    pub fn try_acquire(&self, task_ref: &str, config: &CircuitBreakerConfig) -> Decision {
        let entry = self.breakers.entry(task_ref.to_string()).or_insert_with(|| Mutex::new(Inner::new()));
        let mut inner = entry.lock();
        let now = Instant::now();

        match inner.state {
            CircuitState::Closed => Decision::Allow,
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| now.duration_since(t)).unwrap_or(Duration::ZERO);
                if elapsed >= config.break_duration {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    Decision::Allow
                } else {
                    Decision::Deny
                }
            }
            CircuitState::HalfOpen => Decision::Allow,
        }
    }

    pub fn record_success(&self, task_ref: &str, config: &CircuitBreakerConfig) {
        let entry = self.breakers.entry(task_ref.to_string()).or_insert_with(|| Mutex::new(Inner::new()));
        let mut inner = entry.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_window.clear();
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= config.half_open_requests {
                    inner.state = CircuitState::Closed;
                    inner.failure_window.clear();
                    inner.opened_at = None;
                    inner.half_open_successes = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, task_ref: &str, config: &CircuitBreakerConfig) {
        let entry = self.breakers.entry(task_ref.to_string()).or_insert_with(|| Mutex::new(Inner::new()));
        let mut inner = entry.lock();
        let now = Instant::now();

        match inner.state {
            CircuitState::Closed => {
                inner.prune_window(config, now);
                inner.failure_window.push_back(now);
                if inner.failure_window.len() as u32 >= config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.half_open_successes = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn force_open(&self, task_ref: &str) {
        let entry = self.breakers.entry(task_ref.to_string()).or_insert_with(|| Mutex::new(Inner::new()));
        let mut inner = entry.lock();
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
    }

    pub fn force_close(&self, task_ref: &str) {
        let entry = self.breakers.entry(task_ref.to_string()).or_insert_with(|| Mutex::new(Inner::new()));
        let mut inner = entry.lock();
        inner.state = CircuitState::Closed;
        inner.failure_window.clear();
        inner.opened_at = None;
        inner.half_open_successes = 0;
    }

    pub fn reset(&self, task_ref: &str) {
        self.breakers.remove(task_ref);
    }

    pub fn snapshot(&self, task_ref: &str) -> CircuitBreakerSnapshot {
        match self.breakers.get(task_ref) {
            Some(entry) => {
                let inner = entry.lock();
                CircuitBreakerSnapshot {
                    task_ref: task_ref.to_string(),
                    state: inner.state,
                    failures_in_window: inner.failure_window.len(),
                    half_open_successes: inner.half_open_successes,
                }
            }
            None => CircuitBreakerSnapshot {
                task_ref: task_ref.to_string(),
                state: CircuitState::Closed,
                failures_in_window: 0,
                half_open_successes: 0,
            },
        }
    }
}
