//! Circuit breaker guarding the external analysis call.
//!
//! ```text
//!            failure_threshold consecutive failures
//!   CLOSED ------------------------------------------> OPEN
//!     ^                                                  |
//!     | trial succeeds                   cooldown passes |
//!     |                                                  v
//!     +------------------- HALF_OPEN <-------------------+
//!                              |
//!                              | trial fails
//!                              +----------------------> OPEN (cooldown restarts)
//! ```
//!
//! There is no timer task: the OPEN -> HALF_OPEN move happens lazily whenever
//! the breaker is consulted and the injected clock says the cooldown passed.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use insightforge_core::{Clock, SharedClock};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub name: String,
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays OPEN before admitting a trial call
    pub cooldown: Duration,
    /// Concurrent trial calls admitted while HALF_OPEN
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "analysis".to_string(),
            failure_threshold: 5,
            cooldown: Duration::from_secs(600),
            half_open_max_requests: 1,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error from [`CircuitBreaker::execute`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BreakerError<E> {
    /// The call was rejected without running.
    #[error("circuit open, retry after {retry_at}")]
    Open { retry_at: DateTime<Utc> },

    /// The call ran and failed.
    #[error(transparent)]
    Inner(E),
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_state_change: DateTime<Utc>,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub open_until: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_state_change: DateTime<Utc>,
    last_failure_time: Option<DateTime<Utc>>,
    open_until: Option<DateTime<Utc>>,
    half_open_in_flight: u32,
}

/// Process-local circuit breaker. Share it as `Arc<CircuitBreaker>`.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: SharedClock,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("inner", &self.inner)
            .finish()
    }
}

enum Admission {
    Closed,
    Trial,
}

/// Releases a HALF_OPEN trial slot if the call is dropped before recording.
struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.breaker.lock();
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            config,
            clock,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_state_change: now,
                last_failure_time: None,
                open_until: None,
                half_open_in_flight: 0,
            }),
        }
    }

    pub fn shared(config: CircuitBreakerConfig, clock: SharedClock) -> Arc<Self> {
        Arc::new(Self::new(config, clock))
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// End of a cooldown starting at `now`, saturating at the far future.
    fn cooldown_end(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.cooldown)
            .ok()
            .and_then(|cooldown| now.checked_add_signed(cooldown))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Move OPEN -> HALF_OPEN if the cooldown has passed.
    fn refresh(&self, inner: &mut Inner, now: DateTime<Utc>) {
        if inner.state == CircuitState::Open && inner.open_until.map_or(true, |until| now >= until) {
            self.transition(inner, CircuitState::HalfOpen, now);
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState, now: DateTime<Utc>) {
        let from = inner.state;
        inner.state = to;
        inner.last_state_change = now;

        match to {
            CircuitState::Open => {
                inner.open_until = Some(self.cooldown_end(now));
                inner.success_count = 0;
                warn!(
                    breaker = %self.config.name,
                    from = %from,
                    failure_count = inner.failure_count,
                    cooldown_secs = self.config.cooldown.as_secs(),
                    "circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.open_until = None;
                inner.half_open_in_flight = 0;
                info!(breaker = %self.config.name, from = %from, "circuit half-open, admitting trial");
            }
            CircuitState::Closed => {
                inner.open_until = None;
                inner.failure_count = 0;
                inner.success_count = 0;
                inner.half_open_in_flight = 0;
                info!(breaker = %self.config.name, from = %from, "circuit closed");
            }
        }
    }

    fn admit(&self) -> Result<Admission, DateTime<Utc>> {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);

        match inner.state {
            CircuitState::Closed => Ok(Admission::Closed),
            CircuitState::Open => Err(inner.open_until.unwrap_or(now)),
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_requests.max(1) {
                    inner.half_open_in_flight += 1;
                    Ok(Admission::Trial)
                } else {
                    // Trial in flight; its outcome decides. Callers back off as if OPEN.
                    Err(self.cooldown_end(now))
                }
            }
        }
    }

    fn record_success(&self, trial: bool) {
        let now = self.clock.now();
        let mut inner = self.lock();

        if trial {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            if inner.state == CircuitState::HalfOpen {
                self.transition(&mut inner, CircuitState::Closed, now);
            }
        } else if inner.state == CircuitState::Closed {
            inner.failure_count = 0;
            inner.success_count = inner.success_count.saturating_add(1);
        }
    }

    fn record_failure(&self, trial: bool) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.last_failure_time = Some(now);

        if trial {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            if inner.state == CircuitState::HalfOpen {
                inner.failure_count = inner.failure_count.saturating_add(1);
                self.transition(&mut inner, CircuitState::Open, now);
            }
        } else if inner.state == CircuitState::Closed {
            inner.failure_count = inner.failure_count.saturating_add(1);
            if inner.failure_count >= self.config.failure_threshold.max(1) {
                self.transition(&mut inner, CircuitState::Open, now);
            }
        }
    }

    /// Run `call` if the circuit admits it, and record the outcome.
    ///
    /// A rejected call never runs `call`.
    pub async fn execute<T, E, F, Fut>(&self, call: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self
            .admit()
            .map_err(|retry_at| BreakerError::Open { retry_at })?;
        let trial = matches!(admission, Admission::Trial);
        let mut slot = TrialSlot {
            breaker: self,
            armed: trial,
        };

        let result = call().await;
        slot.armed = false;

        match &result {
            Ok(_) => self.record_success(trial),
            Err(_) => self.record_failure(trial),
        }
        result.map_err(BreakerError::Inner)
    }

    pub fn state(&self) -> CircuitState {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        inner.state
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);

        BreakerMetrics {
            name: self.config.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_state_change: inner.last_state_change,
            last_failure_time: inner.last_failure_time,
            open_until: inner.open_until,
        }
    }
}
