use std::future::Future;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::CircuitBreakerConfig;
use crate::errors::{MeshError, MeshResult};
use crate::types::ServiceId;

/// Circuit breaker state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls fail fast.
    Open,
    /// Single probing calls test whether the service recovered.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    probe_successes: u32,
    probe_in_flight: bool,
    last_failure_time: Option<Instant>,
    trips: u64,
    successes: u64,
    failures: u64,
    rejected: u64,
}

impl BreakerState {
    const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            probe_successes: 0,
            probe_in_flight: false,
            last_failure_time: None,
            trips: 0,
            successes: 0,
            failures: 0,
            rejected: 0,
        }
    }

    /// Moves an open circuit whose recovery timeout elapsed to half-open.
    fn refresh(&mut self, config: &CircuitBreakerConfig) {
        if self.state != CircuitState::Open {
            return;
        }
        let recovered = self
            .last_failure_time
            .map_or(true, |at| at.elapsed() >= config.recovery_timeout.as_duration());
        if recovered {
            self.state = CircuitState::HalfOpen;
            self.probe_successes = 0;
            self.probe_in_flight = false;
            debug!("circuit moved to half-open");
        }
    }

    fn admit(&mut self, config: &CircuitBreakerConfig) -> Option<Admission> {
        self.refresh(config);
        match self.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::HalfOpen if !self.probe_in_flight => {
                self.probe_in_flight = true;
                Some(Admission::Probe)
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                self.rejected += 1;
                None
            }
        }
    }

    fn record_success(&mut self, admission: Admission, config: &CircuitBreakerConfig) -> bool {
        self.successes += 1;
        self.consecutive_failures = 0;
        if admission == Admission::Probe && self.state == CircuitState::HalfOpen {
            self.probe_in_flight = false;
            self.probe_successes += 1;
            if self.probe_successes >= config.half_open_successes.into_inner() {
                self.state = CircuitState::Closed;
                self.probe_successes = 0;
                return true;
            }
        }
        false
    }

    fn record_failure(&mut self, admission: Admission, config: &CircuitBreakerConfig) -> bool {
        self.failures += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_time = Some(Instant::now());
        let trip = match self.state {
            CircuitState::HalfOpen => admission == Admission::Probe,
            CircuitState::Closed => {
                self.consecutive_failures >= config.failure_threshold.into_inner()
            }
            CircuitState::Open => false,
        };
        if admission == Admission::Probe {
            self.probe_in_flight = false;
        }
        if trip {
            self.state = CircuitState::Open;
            self.probe_successes = 0;
            self.trips += 1;
        }
        trip
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

/// Frees the half-open probe slot if the probing call is abandoned.
struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.state.lock().probe_in_flight = false;
        }
    }
}

/// Per-service circuit breaker.
///
/// Opens after `failure_threshold` consecutive failures and fails calls
/// fast with [`MeshError::CircuitOpen`]. Once `recovery_timeout` has passed
/// since the last failure, one probing call at a time is let through;
/// `half_open_successes` consecutive probe successes close the circuit and
/// any probe failure opens it again. Every transition happens under one
/// lock, so racing calls never both pass a circuit that just tripped.
#[derive(Debug)]
pub struct CircuitBreaker {
    service_id: ServiceId,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// A closed breaker for `service_id`.
    pub const fn new(service_id: ServiceId, config: CircuitBreakerConfig) -> Self {
        Self {
            service_id,
            config,
            state: Mutex::new(BreakerState::new()),
        }
    }

    /// Runs `operation` unless the circuit is open. Every error returned by
    /// the operation counts as a failure.
    pub async fn call<T, F, Fut>(&self, operation: F) -> MeshResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = MeshResult<T>>,
    {
        let admission = self
            .state
            .lock()
            .admit(&self.config)
            .ok_or_else(|| MeshError::CircuitOpen(self.service_id.clone()))?;
        let mut slot = ProbeSlot {
            breaker: self,
            armed: admission == Admission::Probe,
        };

        let result = operation().await;

        slot.armed = false;
        match &result {
            Ok(_) => self.record_success(admission),
            Err(_) => self.record_failure(admission),
        }
        result
    }

    fn record_success(&self, admission: Admission) {
        let closed = self.state.lock().record_success(admission, &self.config);
        if closed {
            info!(service_id = %self.service_id, "circuit closed");
        }
    }

    fn record_failure(&self, admission: Admission) {
        let (tripped, failures) = {
            let mut state = self.state.lock();
            let tripped = state.record_failure(admission, &self.config);
            (tripped, state.consecutive_failures)
        };
        if tripped {
            warn!(
                service_id = %self.service_id,
                consecutive_failures = failures,
                "circuit opened"
            );
        }
    }

    /// Current state. An open circuit whose recovery timeout elapsed reports
    /// half-open.
    pub fn state(&self) -> CircuitState {
        let mut state = self.state.lock();
        state.refresh(&self.config);
        state.state
    }

    /// Times the circuit opened.
    pub fn trips(&self) -> u64 {
        self.state.lock().trips
    }

    /// Settings in force.
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Counters and state.
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut state = self.state.lock();
        state.refresh(&self.config);
        CircuitBreakerStats {
            service_id: self.service_id.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            trips: state.trips,
            successes: state.successes,
            failures: state.failures,
            rejected: state.rejected,
        }
    }
}

/// Circuit breaker statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    /// Guarded service
    pub service_id: ServiceId,
    /// Current state
    pub state: CircuitState,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Times the circuit opened
    pub trips: u64,
    /// Calls that succeeded
    pub successes: u64,
    /// Calls that failed
    pub failures: u64,
    /// Calls rejected without being attempted
    pub rejected: u64,
}
