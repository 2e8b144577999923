//! Per-plugin circuit breakers gating job admission.
//!
//! Each plugin gets one breaker, created lazily the first time it is
//! consulted. Transitions are driven only by job outcomes:
//!
//! ```text
//!            failures >= threshold              recovery_timeout elapsed
//!  Closed ─────────────────────────► Open ─────────────────────────► HalfOpen
//!    ▲                                 ▲                                │
//!    │            trial succeeds       │          trial fails           │
//!    └─────────────────────────────────┼────────────────────────────────┤
//!                                      └────────────────────────────────┘
//! ```
//!
//! In `HalfOpen` exactly one trial job is admitted at a time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{RuntimeError, RuntimeResult};

/// State of a plugin's breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker thresholds, shared by every plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Time the breaker stays open before a trial job is admitted.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Serializable view of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub plugin_id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    opened_at_utc: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            opened_at_utc: None,
            trial_in_flight: false,
        }
    }

    /// Move `Open` to `HalfOpen` once the recovery window has elapsed.
    fn refresh(&mut self, recovery_timeout: Duration) {
        if self.state == CircuitState::Open
            && self
                .opened_at
                .is_some_and(|opened| opened.elapsed() >= recovery_timeout)
        {
            self.state = CircuitState::HalfOpen;
            self.trial_in_flight = false;
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.opened_at_utc = Some(Utc::now());
        self.trial_in_flight = false;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.opened_at_utc = None;
        self.trial_in_flight = false;
    }

    fn admits(&self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => !self.trial_in_flight,
        }
    }

    fn snapshot(&self, plugin_id: &str) -> CircuitSnapshot {
        CircuitSnapshot {
            plugin_id: plugin_id.to_string(),
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            opened_at: self.opened_at_utc,
        }
    }
}

/// Registry holding at most one breaker per plugin id.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CircuitBreaker>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a job for `plugin_id` would currently be admitted.
    ///
    /// Does not claim the half-open trial slot; use [`Self::acquire`] for that.
    pub fn is_admitted(&self, plugin_id: &str) -> bool {
        let mut breakers = self.lock();
        match breakers.get_mut(plugin_id) {
            Some(breaker) => {
                breaker.refresh(self.config.recovery_timeout);
                breaker.admits()
            }
            None => true,
        }
    }

    /// Admit a job for `plugin_id`, claiming the trial slot when half-open.
    ///
    /// Returns `true` when the admitted job is the half-open trial.
    pub fn acquire(&self, plugin_id: &str) -> RuntimeResult<bool> {
        let mut breakers = self.lock();
        let breaker = breakers
            .entry(plugin_id.to_string())
            .or_insert_with(CircuitBreaker::new);
        breaker.refresh(self.config.recovery_timeout);

        if !breaker.admits() {
            debug!(plugin = %plugin_id, state = ?breaker.state, "Job admission refused");
            return Err(RuntimeError::CircuitOpen {
                plugin_id: plugin_id.to_string(),
                recovery_timeout: self.config.recovery_timeout,
            });
        }

        if breaker.state == CircuitState::HalfOpen {
            info!(plugin = %plugin_id, "Admitting half-open trial job");
            breaker.trial_in_flight = true;
            return Ok(true);
        }
        Ok(false)
    }

    /// Give back a trial slot whose job ended without an outcome (cancelled).
    pub fn release(&self, plugin_id: &str) {
        if let Some(breaker) = self.lock().get_mut(plugin_id) {
            if breaker.state == CircuitState::HalfOpen {
                breaker.trial_in_flight = false;
            }
        }
    }

    /// Record a successful job. `trial` marks the job admitted as the
    /// half-open trial; while half-open only its outcome counts.
    pub fn record_success(&self, plugin_id: &str, trial: bool) {
        let mut breakers = self.lock();
        let breaker = breakers
            .entry(plugin_id.to_string())
            .or_insert_with(CircuitBreaker::new);

        match breaker.state {
            CircuitState::HalfOpen if trial => {
                info!(plugin = %plugin_id, "Trial job succeeded, circuit closed");
                breaker.close();
            }
            CircuitState::Closed => breaker.consecutive_failures = 0,
            // Jobs admitted before the breaker tripped do not decide recovery.
            CircuitState::HalfOpen | CircuitState::Open => {
                debug!(plugin = %plugin_id, state = ?breaker.state, "Ignoring non-trial success");
            }
        }
    }

    /// Record a failed job. `trial` has the same meaning as in
    /// [`Self::record_success`].
    pub fn record_failure(&self, plugin_id: &str, trial: bool) {
        let mut breakers = self.lock();
        let breaker = breakers
            .entry(plugin_id.to_string())
            .or_insert_with(CircuitBreaker::new);

        match breaker.state {
            CircuitState::Closed => {
                breaker.consecutive_failures = breaker.consecutive_failures.saturating_add(1);
                if breaker.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        plugin = %plugin_id,
                        failures = breaker.consecutive_failures,
                        "Circuit opened after consecutive failures"
                    );
                    breaker.open();
                }
            }
            CircuitState::HalfOpen if trial => {
                breaker.consecutive_failures = breaker.consecutive_failures.saturating_add(1);
                warn!(plugin = %plugin_id, "Trial job failed, circuit reopened");
                breaker.open();
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                debug!(plugin = %plugin_id, state = ?breaker.state, "Ignoring non-trial failure");
            }
        }
    }

    /// Current state; `Closed` for plugins never seen.
    pub fn get_state(&self, plugin_id: &str) -> CircuitState {
        let mut breakers = self.lock();
        match breakers.get_mut(plugin_id) {
            Some(breaker) => {
                breaker.refresh(self.config.recovery_timeout);
                breaker.state
            }
            None => CircuitState::Closed,
        }
    }

    pub fn snapshot(&self, plugin_id: &str) -> Option<CircuitSnapshot> {
        let mut breakers = self.lock();
        breakers.get_mut(plugin_id).map(|breaker| {
            breaker.refresh(self.config.recovery_timeout);
            breaker.snapshot(plugin_id)
        })
    }

    /// Snapshots of every known breaker, sorted by plugin id.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut breakers = self.lock();
        let mut snapshots: Vec<CircuitSnapshot> = breakers
            .iter_mut()
            .map(|(id, breaker)| {
                breaker.refresh(self.config.recovery_timeout);
                breaker.snapshot(id)
            })
            .collect();
        snapshots.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        snapshots
    }

    /// Force the breaker for `plugin_id` back to `Closed`.
    ///
    /// Returns whether a breaker existed.
    pub fn reset(&self, plugin_id: &str) -> bool {
        match self.lock().get_mut(plugin_id) {
            Some(breaker) => {
                breaker.close();
                info!(plugin = %plugin_id, "Circuit breaker reset");
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for breaker in self.lock().values_mut() {
            breaker.close();
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
