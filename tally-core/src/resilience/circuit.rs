// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Circuit breaker with a single-probe half-open state.
//!
//! ```text
//!   Closed ──(N consecutive failures)──► Open ──(cooldown)──► HalfOpen
//!     ▲                                   ▲                      │
//!     └──────────(probe succeeds)─────────┼──────────────────────┤
//!                                         └───(probe fails)──────┘
//! ```

use parking_lot::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive failures that trip the breaker
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a probe
    pub open_duration: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            open_duration: Duration::from_secs(30),
        }
    }
}

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed { failures: u32 },
    Open { until: Instant },
    /// A probe call is in flight; everything else is rejected.
    HalfOpen,
}

#[derive(Debug, Error)]
pub enum CircuitError<E: std::error::Error> {
    #[error("Circuit open, retry after {retry_after:?}")]
    Open { retry_after: Duration },
    #[error("Operation failed: {0}")]
    Inner(E),
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(State::Closed { failures: 0 }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state. An open breaker whose cooldown has elapsed reports
    /// `HalfOpen` since the next call will be admitted as the probe.
    pub fn state(&self) -> CircuitState {
        match *self.state.lock() {
            State::Closed { .. } => CircuitState::Closed,
            State::Open { until } if Instant::now() >= until => CircuitState::HalfOpen,
            State::Open { .. } => CircuitState::Open,
            State::HalfOpen => CircuitState::HalfOpen,
        }
    }

    /// Consecutive failures recorded while closed.
    pub fn failure_count(&self) -> u32 {
        match *self.state.lock() {
            State::Closed { failures } => failures,
            _ => self.config.failure_threshold,
        }
    }

    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::error::Error,
    {
        let ticket = self.admit().map_err(|retry_after| CircuitError::Open { retry_after })?;

        let result = operation().await;
        match &result {
            Ok(_) => ticket.succeed(),
            Err(_) => ticket.fail(),
        }

        result.map_err(CircuitError::Inner)
    }

    fn admit(&self) -> Result<Ticket<'_>, Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();
        match *state {
            State::Closed { .. } => Ok(Ticket::new(self, false)),
            State::Open { until } if now >= until => {
                *state = State::HalfOpen;
                info!(breaker = %self.name, "Circuit half-open, admitting probe");
                Ok(Ticket::new(self, true))
            }
            State::Open { until } => Err(until - now),
            State::HalfOpen => Err(Duration::ZERO),
        }
    }

    fn record_success(&self, probe: bool) {
        let mut state = self.state.lock();
        match *state {
            State::HalfOpen if probe => {
                *state = State::Closed { failures: 0 };
                info!(breaker = %self.name, "Circuit closed after successful probe");
            }
            State::Closed { .. } => *state = State::Closed { failures: 0 },
            _ => {}
        }
    }

    fn record_failure(&self, probe: bool) {
        let mut state = self.state.lock();
        match *state {
            State::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.config.failure_threshold {
                    *state = State::Open {
                        until: Instant::now() + self.config.open_duration,
                    };
                    warn!(
                        breaker = %self.name,
                        failures,
                        cooldown_ms = self.config.open_duration.as_millis() as u64,
                        "Circuit opened"
                    );
                } else {
                    *state = State::Closed { failures };
                }
            }
            State::HalfOpen if probe => {
                *state = State::Open {
                    until: Instant::now() + self.config.open_duration,
                };
                warn!(breaker = %self.name, "Probe failed, circuit re-opened");
            }
            _ => {}
        }
    }
}

/// Admission for one call. A probe that is dropped before it settles counts
/// as a failed probe so the breaker cannot stay half-open forever.
struct Ticket<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> Ticket<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    fn succeed(mut self) {
        self.settled = true;
        self.breaker.record_success(self.probe);
    }

    fn fail(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.probe);
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.record_failure(true);
        }
    }
}
