//! Per provider account circuit breakers.
//!
//! ```text
//!   CLOSED ──(failure rate >= threshold, >= min_requests)──▶ OPEN
//!     ▲                                                        │
//!     │ max_requests consecutive successes          timeout    │
//!     │                                                        ▼
//!     └────────────────────── HALF-OPEN ◀──────────────────────┘
//!                                 │ any failure
//!                                 └──────────▶ OPEN
//! ```
//!
//! Counts live in a window that resets every `interval` while closed and on
//! every state change. Each reset bumps a generation number; outcomes
//! reported against an older generation are ignored.

use dashmap::DashMap;
use pushgate_core::config::CircuitConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Request and outcome counts for the current window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

/// Sliding window breaker for one provider account.
#[derive(Debug, Clone)]
pub struct Breaker {
    config: CircuitConfig,
    state: CircuitState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

impl Breaker {
    pub fn new(config: CircuitConfig, now: Instant) -> Self {
        let expiry = window_expiry(config.interval(), now);
        Self {
            config,
            state: CircuitState::Closed,
            generation: 0,
            counts: Counts::default(),
            expiry,
        }
    }

    /// State at `now`, applying window resets and the open timeout.
    pub fn state_at(&mut self, now: Instant) -> CircuitState {
        match self.state {
            CircuitState::Closed => {
                if self.expiry.is_some_and(|e| e < now) {
                    self.generation += 1;
                    self.counts = Counts::default();
                    self.expiry = window_expiry(self.config.interval(), now);
                }
            }
            CircuitState::Open => {
                if self.expiry.is_some_and(|e| e < now) {
                    self.set_state(CircuitState::HalfOpen, now);
                }
            }
            CircuitState::HalfOpen => {}
        }
        self.state
    }

    /// Whether a request may go to this account right now.
    pub fn admits_at(&mut self, now: Instant) -> bool {
        match self.state_at(now) {
            CircuitState::Open => false,
            CircuitState::HalfOpen => self.counts.requests < self.config.max_requests,
            CircuitState::Closed => true,
        }
    }

    /// Count a request and return the generation its outcome belongs to.
    pub fn begin_at(&mut self, now: Instant) -> u64 {
        self.state_at(now);
        self.counts.requests = self.counts.requests.saturating_add(1);
        self.generation
    }

    /// Record an outcome. Ignored when the window has moved on since
    /// `generation` was handed out.
    pub fn finish_at(&mut self, generation: u64, success: bool, now: Instant) {
        let state = self.state_at(now);
        if generation != self.generation {
            return;
        }

        if success {
            self.counts.total_successes += 1;
            self.counts.consecutive_successes += 1;
            self.counts.consecutive_failures = 0;
            if state == CircuitState::HalfOpen
                && self.counts.consecutive_successes >= self.config.max_requests
            {
                self.set_state(CircuitState::Closed, now);
            }
            return;
        }

        self.counts.total_failures += 1;
        self.counts.consecutive_failures += 1;
        self.counts.consecutive_successes = 0;

        if state == CircuitState::HalfOpen {
            self.set_state(CircuitState::Open, now);
            return;
        }

        if self.counts.requests >= self.config.min_requests {
            let rate = f64::from(self.counts.total_failures) / f64::from(self.counts.requests);
            if rate >= self.config.failure_threshold {
                self.set_state(CircuitState::Open, now);
            }
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn counts(&self) -> Counts {
        self.counts
    }

    fn set_state(&mut self, state: CircuitState, now: Instant) {
        if self.state == state {
            return;
        }
        let previous = self.state;
        self.state = state;
        self.generation += 1;
        self.counts = Counts::default();
        self.expiry = match state {
            CircuitState::Closed => window_expiry(self.config.interval(), now),
            CircuitState::Open => Some(now + self.config.timeout()),
            CircuitState::HalfOpen => None,
        };

        if state == CircuitState::Open {
            warn!(from = %previous, to = %state, "Circuit breaker state changed");
        } else {
            info!(from = %previous, to = %state, "Circuit breaker state changed");
        }
    }
}

fn window_expiry(interval: Duration, now: Instant) -> Option<Instant> {
    (!interval.is_zero()).then(|| now + interval)
}

/// Breakers for every provider account, created on first use.
pub struct CircuitBreakers {
    config: CircuitConfig,
    breakers: DashMap<u64, Breaker>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    fn with_breaker<T>(&self, account_id: u64, f: impl FnOnce(&mut Breaker, Instant) -> T) -> T {
        let now = Instant::now();
        let mut breaker = self
            .breakers
            .entry(account_id)
            .or_insert_with(|| Breaker::new(self.config.clone(), now));
        f(&mut breaker, now)
    }

    pub fn admits(&self, account_id: u64) -> bool {
        // Unknown accounts have a fresh closed breaker
        if !self.breakers.contains_key(&account_id) {
            return true;
        }
        self.with_breaker(account_id, |b, now| b.admits_at(now))
    }

    pub fn begin(&self, account_id: u64) -> u64 {
        self.with_breaker(account_id, |b, now| b.begin_at(now))
    }

    pub fn finish(&self, account_id: u64, generation: u64, success: bool) {
        self.with_breaker(account_id, |b, now| b.finish_at(generation, success, now))
    }

    /// Record an outcome against the current window.
    pub fn record(&self, account_id: u64, success: bool) {
        self.with_breaker(account_id, |b, now| {
            b.state_at(now);
            let generation = b.generation();
            b.finish_at(generation, success, now)
        })
    }

    pub fn state(&self, account_id: u64) -> CircuitState {
        self.with_breaker(account_id, |b, now| b.state_at(now))
    }

    pub fn reset(&self, account_id: u64) {
        self.breakers.remove(&account_id);
    }
}
