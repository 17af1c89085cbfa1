//! Per-agent token-bucket rate limiting.
//!
//! Buckets refill continuously at `calls_per_second` up to `burst` tokens.
//! Under `Queue` a caller that finds the bucket empty reserves the next
//! token (the balance goes negative) and sleeps until it is due, so queued
//! callers are served in arrival order. Under `Reject`, or when the wait
//! would exceed `max_queue_wait_ms`, the call fails with `RateLimited`.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::error::EnhancementError;
use crate::pipeline_config::{RateLimitConfig, RateLimitPolicy};

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for (or fail to get) a token for `agent`.
    pub async fn acquire(&self, agent: &str) -> Result<(), EnhancementError> {
        let wait = self.reserve_at(agent, Instant::now())?;
        if !wait.is_zero() {
            tracing::debug!(agent, wait_ms = wait.as_millis() as u64, "Rate limited, queueing");
            tokio::time::sleep(wait).await;
        }
        Ok(())
    }

    /// Take a token at `now`. Returns how long the caller must wait before
    /// its reserved token is due.
    pub fn reserve_at(&self, agent: &str, now: Instant) -> Result<Duration, EnhancementError> {
        let capacity = f64::from(self.config.burst.max(1));
        let rate = self.config.calls_per_second;

        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let bucket = buckets.entry(agent.to_string()).or_insert_with(|| TokenBucket {
            tokens: capacity,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(capacity);
        if now > bucket.last_refill {
            bucket.last_refill = now;
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(Duration::ZERO);
        }

        let rejected = || EnhancementError::RateLimited {
            agent: agent.to_string(),
        };
        if self.config.policy == RateLimitPolicy::Reject {
            return Err(rejected());
        }

        // A refill rate too slow to express as a Duration can never be waited out
        let wait = match Duration::try_from_secs_f64((1.0 - bucket.tokens) / rate) {
            Ok(wait) => wait,
            Err(_) => Duration::MAX,
        };
        if wait > self.config.max_queue_wait() {
            tracing::warn!(
                agent,
                wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                max_wait_ms = self.config.max_queue_wait_ms,
                "Rate limit queue wait too long, rejecting"
            );
            return Err(rejected());
        }

        bucket.tokens -= 1.0;
        Ok(wait)
    }
}
