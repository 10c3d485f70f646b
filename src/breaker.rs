//! Per-peer circuit breaker.
//!
//! A peer that fails `failure_threshold` times in a row is skipped until
//! `cooldown` has passed, after which one probe is allowed through
//! (half-open). A successful probe closes the circuit, a failed one reopens it.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
struct PeerCircuit {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Instant,
}

impl PeerCircuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: Instant::now(),
        }
    }
}

#[derive(Debug, Default)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    circuits: Mutex<HashMap<String, PeerCircuit>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PeerCircuit>> {
        self.circuits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a request to `endpoint` should be attempted now.
    pub fn allows(&self, endpoint: &str) -> bool {
        let mut circuits = self.lock();
        let Some(circuit) = circuits.get_mut(endpoint) else {
            return true;
        };
        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false,
            CircuitState::Open if circuit.opened_at.elapsed() >= self.config.cooldown => {
                circuit.state = CircuitState::HalfOpen;
                true
            }
            CircuitState::Open => false,
        }
    }

    pub fn record_success(&self, endpoint: &str) {
        if let Some(circuit) = self.lock().get_mut(endpoint) {
            circuit.state = CircuitState::Closed;
            circuit.consecutive_failures = 0;
        }
    }

    pub fn record_failure(&self, endpoint: &str) {
        let mut circuits = self.lock();
        let circuit = circuits
            .entry(endpoint.to_owned())
            .or_insert_with(PeerCircuit::new);
        circuit.consecutive_failures += 1;
        let trip = circuit.state == CircuitState::HalfOpen
            || circuit.consecutive_failures >= self.config.failure_threshold;
        if trip {
            circuit.state = CircuitState::Open;
            circuit.opened_at = Instant::now();
        }
    }

    pub fn state(&self, endpoint: &str) -> CircuitState {
        self.lock()
            .get(endpoint)
            .map_or(CircuitState::Closed, |c| c.state)
    }
}
