//! Per-agent circuit breaker.
//!
//! ```text
//! Closed --(failures >= threshold)--> Open --(reset timeout)--> HalfOpen
//!   ^                                   ^                          |
//!   |                                   +------(probe fails)-------+
//!   +----------------------(probe succeeds)------------------------+
//! ```
//!
//! Every transition happens under the breaker's mutex. Timing methods have
//! `*_at(now)` forms so tests can drive the clock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::EnhancementError;
use crate::pipeline_config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal call on a closed circuit.
    Normal,
    /// The single trial call of a half-open circuit.
    Probe,
}

/// Point-in-time view of one breaker, for observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub agent: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub threshold: u32,
    pub reset_timeout_ms: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Remaining open time; 0 unless the circuit is open.
    pub time_until_retry_ms: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    agent: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(agent: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            agent: agent.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                last_failure_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn try_acquire(&self) -> Result<Admission, EnhancementError> {
        self.try_acquire_at(Instant::now())
    }

    /// Admit or reject a call. An open circuit past its reset timeout moves
    /// to half-open and admits exactly one probe.
    pub fn try_acquire_at(&self, now: Instant) -> Result<Admission, EnhancementError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let remaining = self.remaining_open_ms(&inner, now);
                if remaining > 0 {
                    return Err(self.open_error(remaining));
                }
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                tracing::info!(agent = %self.agent, "Circuit half-open, admitting probe");
                Ok(Admission::Probe)
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(self.open_error(0))
                } else {
                    inner.probe_in_flight = true;
                    Ok(Admission::Probe)
                }
            }
        }
    }

    /// Record a successful call. Only the probe may close a half-open
    /// circuit; late outcomes of calls admitted while closed are ignored
    /// once the circuit has left `Closed`.
    pub fn record_success(&self, admission: Admission) {
        let mut inner = self.lock();
        match (inner.state, admission) {
            (CircuitState::Closed, Admission::Normal) => inner.failure_count = 0,
            (CircuitState::HalfOpen, Admission::Probe) => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.opened_at = None;
                inner.probe_in_flight = false;
                tracing::info!(agent = %self.agent, "Circuit closed after successful probe");
            }
            (state, admission) => {
                tracing::debug!(
                    agent = %self.agent,
                    state = state.as_str(),
                    ?admission,
                    "Stale success ignored"
                );
            }
        }
    }

    pub fn record_failure(&self, admission: Admission) {
        self.record_failure_at(admission, Instant::now());
    }

    pub fn record_failure_at(&self, admission: Admission, now: Instant) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_at = Some(Utc::now());

        match (inner.state, admission) {
            (CircuitState::Closed, Admission::Normal)
                if inner.failure_count >= self.config.failure_threshold =>
            {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                tracing::warn!(
                    agent = %self.agent,
                    failures = inner.failure_count,
                    reset_timeout_ms = self.config.reset_timeout_ms,
                    "Circuit opened"
                );
            }
            (CircuitState::HalfOpen, Admission::Probe) => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.probe_in_flight = false;
                tracing::warn!(agent = %self.agent, "Probe failed, circuit re-opened");
            }
            // A late failure never disturbs an open circuit or a running half-open trial
            _ => {}
        }
    }

    /// Give back a probe slot whose call ended without reaching the agent.
    pub fn release_probe(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> CircuitSnapshot {
        let inner = self.lock();
        let time_until_retry_ms = if inner.state == CircuitState::Open {
            self.remaining_open_ms(&inner, now)
        } else {
            0
        };
        CircuitSnapshot {
            agent: self.agent.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            threshold: self.config.failure_threshold,
            reset_timeout_ms: self.config.reset_timeout_ms,
            last_failure_at: inner.last_failure_at,
            time_until_retry_ms,
        }
    }

    fn remaining_open_ms(&self, inner: &BreakerInner, now: Instant) -> u64 {
        let elapsed = inner
            .opened_at
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default();
        self.config
            .reset_timeout()
            .saturating_sub(elapsed)
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX)
    }

    fn open_error(&self, retry_in_ms: u64) -> EnhancementError {
        EnhancementError::CircuitOpen {
            agent: self.agent.clone(),
            retry_in_ms,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ═══════════════════════════════════════════════════════════
// BreakerRegistry: one breaker per agent identity
// ═══════════════════════════════════════════════════════════

#[derive(Debug)]
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// The breaker for an agent, created closed on first use.
    pub fn get(&self, agent: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            breakers
                .entry(agent.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(agent, self.config.clone()))),
        )
    }

    pub fn state(&self, agent: &str) -> Option<CircuitState> {
        self.existing(agent).map(|b| b.state())
    }

    pub fn failure_count(&self, agent: &str) -> Option<u32> {
        self.existing(agent).map(|b| b.failure_count())
    }

    pub fn snapshot(&self, agent: &str) -> Option<CircuitSnapshot> {
        self.existing(agent).map(|b| b.snapshot())
    }

    /// Snapshots of every known breaker, sorted by agent name.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut snapshots: Vec<CircuitSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.agent.cmp(&b.agent));
        snapshots
    }

    fn existing(&self, agent: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "outcomes_analyst",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout_ms: reset_ms,
            },
        )
    }

    #[test]
    fn starts_closed() {
        let b = breaker(3, 1000);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.try_acquire(), Ok(Admission::Normal));
    }

    #[test]
    fn opens_at_threshold_and_fails_fast() {
        let b = breaker(3, 1000);
        let t0 = Instant::now();
        for _ in 0..3 {
            assert!(b.try_acquire_at(t0).is_ok());
            b.record_failure_at(Admission::Normal, t0);
        }
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.failure_count(), 3);

        let err = b.try_acquire_at(t0 + Duration::from_millis(10)).unwrap_err();
        match err {
            EnhancementError::CircuitOpen { agent, retry_in_ms } => {
                assert_eq!(agent, "outcomes_analyst");
                assert_eq!(retry_in_ms, 990);
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[test]
    fn probe_success_closes_circuit() {
        let b = breaker(3, 1000);
        let t0 = Instant::now();
        for _ in 0..3 {
            b.record_failure_at(Admission::Normal, t0);
        }

        let after = t0 + Duration::from_millis(1000);
        assert_eq!(b.try_acquire_at(after), Ok(Admission::Probe));
        assert_eq!(b.state(), CircuitState::HalfOpen);

        b.record_success(Admission::Probe);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failure_count(), 0);
        assert_eq!(b.try_acquire_at(after), Ok(Admission::Normal));
    }

    #[test]
    fn only_one_probe_at_a_time() {
        let b = breaker(1, 100);
        let t0 = Instant::now();
        b.record_failure_at(Admission::Normal, t0);

        let later = t0 + Duration::from_millis(150);
        assert_eq!(b.try_acquire_at(later), Ok(Admission::Probe));
        assert!(matches!(
            b.try_acquire_at(later),
            Err(EnhancementError::CircuitOpen { retry_in_ms: 0, .. })
        ));
    }

    #[test]
    fn late_normal_success_does_not_close_half_open_circuit() {
        let b = breaker(1, 100);
        let t0 = Instant::now();
        assert_eq!(b.try_acquire_at(t0), Ok(Admission::Normal));
        b.record_failure_at(Admission::Normal, t0);

        let later = t0 + Duration::from_millis(150);
        assert_eq!(b.try_acquire_at(later), Ok(Admission::Probe));

        // A call admitted before the circuit opened finishes now
        b.record_success(Admission::Normal);
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(b.try_acquire_at(later).is_err());

        b.record_success(Admission::Probe);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.try_acquire_at(later), Ok(Admission::Normal));
    }

    #[test]
    fn late_normal_failure_leaves_trial_call_in_charge() {
        let b = breaker(1, 100);
        let t0 = Instant::now();
        b.record_failure_at(Admission::Normal, t0);

        let later = t0 + Duration::from_millis(150);
        assert_eq!(b.try_acquire_at(later), Ok(Admission::Probe));

        b.record_failure_at(Admission::Normal, later);
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(b.try_acquire_at(later).is_err());

        b.record_success(Admission::Probe);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn late_success_ignored_while_open() {
        let b = breaker(1, 1000);
        let t0 = Instant::now();
        b.record_failure_at(Admission::Normal, t0);
        b.record_success(Admission::Normal);
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.failure_count(), 1);
    }

    #[test]
    fn probe_failure_reopens_and_restarts_timeout() {
        let b = breaker(1, 100);
        let t0 = Instant::now();
        b.record_failure_at(Admission::Normal, t0);

        let t1 = t0 + Duration::from_millis(100);
        assert_eq!(b.try_acquire_at(t1), Ok(Admission::Probe));
        b.record_failure_at(Admission::Probe, t1);
        assert_eq!(b.state(), CircuitState::Open);

        // Timeout counts from the probe failure, not the first opening
        assert!(b.try_acquire_at(t1 + Duration::from_millis(50)).is_err());
        assert_eq!(
            b.try_acquire_at(t1 + Duration::from_millis(100)),
            Ok(Admission::Probe)
        );
    }

    #[test]
    fn released_probe_can_be_reacquired() {
        let b = breaker(1, 0);
        let t0 = Instant::now();
        b.record_failure_at(Admission::Normal, t0);
        assert_eq!(b.try_acquire_at(t0), Ok(Admission::Probe));
        b.release_probe();
        assert_eq!(b.try_acquire_at(t0), Ok(Admission::Probe));
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let b = breaker(3, 1000);
        b.record_failure(Admission::Normal);
        b.record_failure(Admission::Normal);
        b.record_success(Admission::Normal);
        b.record_failure(Admission::Normal);
        b.record_failure(Admission::Normal);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failure_count(), 2);
    }

    #[test]
    fn snapshot_reports_time_until_retry() {
        let b = breaker(2, 5000);
        let t0 = Instant::now();
        let snap = b.snapshot_at(t0);
        assert_eq!(snap.state, CircuitState::Closed);
        assert!(snap.last_failure_at.is_none());
        assert_eq!(snap.time_until_retry_ms, 0);

        b.record_failure_at(Admission::Normal, t0);
        b.record_failure_at(Admission::Normal, t0);
        let snap = b.snapshot_at(t0 + Duration::from_millis(2000));
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.failure_count, 2);
        assert_eq!(snap.threshold, 2);
        assert_eq!(snap.time_until_retry_ms, 3000);
        assert!(snap.last_failure_at.is_some());
    }

    #[test]
    fn registry_shares_breaker_per_agent() {
        let registry = BreakerRegistry::new(CircuitBreakerConfig::default());
        assert!(registry.state("a").is_none());

        let a1 = registry.get("a");
        let a2 = registry.get("a");
        assert!(Arc::ptr_eq(&a1, &a2));

        a1.record_failure(Admission::Normal);
        assert_eq!(registry.failure_count("a"), Some(1));
        assert_eq!(registry.get("b").failure_count(), 0);

        let names: Vec<String> = registry.snapshots().into_iter().map(|s| s.agent).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn concurrent_failures_are_not_lost() {
        let registry = Arc::new(BreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1000,
            reset_timeout_ms: 1000,
        }));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        registry.get("shared").record_failure(Admission::Normal);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.failure_count("shared"), Some(400));
    }
}
