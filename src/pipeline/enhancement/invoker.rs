//! One logical agent call with rate limiting, circuit breaking, per-attempt
//! timeout and retry.
//!
//! Order per call:
//! ```text
//! cancelled? → rate limiter → breaker admission → attempt (timeout) ⟲ retry → breaker outcome
//! ```
//! The breaker sees exactly one success or failure per logical call, never
//! one per attempt. A half-open probe gets a single attempt.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::circuit_breaker::{Admission, BreakerRegistry, CircuitBreaker};
use super::error::EnhancementError;
use super::orchestrator::CancellationSignal;
use super::rate_limit::RateLimiter;
use super::traits::AgentBackend;
use super::types::{clamp_confidence, AgentRequest, AgentResult};
use crate::pipeline_config::{PipelineConfig, RetryConfig};

/// Outcome of one logical call.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub result: Result<AgentResult, EnhancementError>,
    /// Attempts that reached the agent (0 when rejected up front).
    pub attempts: u32,
    /// Sum of every attempt's duration, failed ones included.
    pub elapsed_ms: u64,
}

impl Invocation {
    fn rejected(error: EnhancementError) -> Self {
        Self {
            result: Err(error),
            attempts: 0,
            elapsed_ms: 0,
        }
    }
}

pub struct ResilientInvoker {
    backend: Arc<dyn AgentBackend>,
    breakers: Arc<BreakerRegistry>,
    limiter: Arc<RateLimiter>,
    retry: RetryConfig,
    call_timeout: Duration,
}

impl ResilientInvoker {
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        breakers: Arc<BreakerRegistry>,
        limiter: Arc<RateLimiter>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            backend,
            breakers,
            limiter,
            retry: config.retry.clone(),
            call_timeout: config.call_timeout(),
        }
    }

    pub async fn invoke(
        &self,
        agent: &str,
        request: &AgentRequest,
        cancel: &CancellationSignal,
    ) -> Invocation {
        if cancel.is_cancelled() {
            return Invocation::rejected(EnhancementError::Cancelled);
        }

        if let Err(e) = self.limiter.acquire(agent).await {
            return Invocation::rejected(e);
        }

        let breaker = self.breakers.get(agent);
        let admission = match breaker.try_acquire() {
            Ok(admission) => admission,
            Err(e) => {
                tracing::debug!(agent, candidate_id = %request.candidate_id, error = %e, "Call rejected by circuit breaker");
                return Invocation::rejected(e);
            }
        };

        let outcome_guard = BreakerOutcome::new(breaker, admission);
        let max_attempts = match admission {
            Admission::Probe => 1,
            Admission::Normal => 1 + self.retry.attempts,
        };

        let mut attempts = 0u32;
        let mut elapsed_ms = 0u64;

        let error = loop {
            attempts += 1;
            let started = Instant::now();
            let outcome = tokio::time::timeout(self.call_timeout, self.backend.call_agent(agent, request)).await;
            let attempt_ms = started.elapsed().as_millis() as u64;
            elapsed_ms += attempt_ms;

            let err = match outcome {
                Ok(Ok(result)) => {
                    outcome_guard.success();
                    tracing::debug!(
                        agent,
                        candidate_id = %request.candidate_id,
                        attempt = attempts,
                        elapsed_ms = attempt_ms,
                        "Agent call succeeded"
                    );
                    return Invocation {
                        result: Ok(normalize(result, agent, request, attempt_ms)),
                        attempts,
                        elapsed_ms,
                    };
                }
                Ok(Err(e)) => e,
                Err(_) => EnhancementError::Timeout {
                    agent: agent.to_string(),
                    after_ms: self.call_timeout.as_millis() as u64,
                },
            };

            tracing::debug!(
                agent,
                candidate_id = %request.candidate_id,
                attempt = attempts,
                error = %err,
                "Agent attempt failed"
            );

            if attempts >= max_attempts || !err.is_retryable() {
                break err;
            }
            tokio::time::sleep(self.retry.backoff.delay_for(attempts)).await;
        };

        if error.counts_against_breaker() {
            outcome_guard.failure();
        } else {
            outcome_guard.release();
        }

        Invocation {
            result: Err(error),
            attempts,
            elapsed_ms,
        }
    }
}

/// Reports one logical call's outcome to its breaker, with the admission
/// the call was granted. Dropped unsettled (the call panicked or was
/// aborted), it records a failure so a half-open trial slot is never left taken.
struct BreakerOutcome {
    breaker: Arc<CircuitBreaker>,
    admission: Admission,
    settled: bool,
}

impl BreakerOutcome {
    fn new(breaker: Arc<CircuitBreaker>, admission: Admission) -> Self {
        Self {
            breaker,
            admission,
            settled: false,
        }
    }

    fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.admission);
    }

    fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.admission);
    }

    /// The call ended without the agent being at fault.
    fn release(mut self) {
        self.settled = true;
        if self.admission == Admission::Probe {
            self.breaker.release_probe();
        }
    }
}

impl Drop for BreakerOutcome {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!(
                agent = self.breaker.agent(),
                "Agent call ended without an outcome, counting it as a failure"
            );
            self.breaker.record_failure(self.admission);
        }
    }
}

/// Clamp confidence and fill fields the agent left empty.
fn normalize(mut result: AgentResult, agent: &str, request: &AgentRequest, attempt_ms: u64) -> AgentResult {
    if result.agent_name.is_empty() {
        result.agent_name = agent.to_string();
    }
    result.confidence = clamp_confidence(result.confidence);
    if result.page_number.is_none() {
        result.page_number = Some(request.page_number);
    }
    if result.processing_time_ms == 0 {
        result.processing_time_ms = attempt_ms;
    }
    result
}
