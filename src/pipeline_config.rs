//! Pipeline configuration.
//!
//! Every tunable of the extraction-and-enhancement pipeline lives here:
//! worker-pool size, per-call timeout, retry policy, circuit breaker,
//! rate limiter, and the geometric detection thresholds. Values are
//! serde-friendly so a JSON file can seed them (see `config::Settings`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pipeline::enhancement::EnhancementError;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Delay between retry attempts of one logical agent call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed { delay_ms: u64 },
    /// `base_ms * 2^(attempt-1)`, capped at `max_ms`.
    Exponential { base_ms: u64, max_ms: u64 },
}

impl Backoff {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { base_ms, max_ms } => {
                let shift = retry.saturating_sub(1).min(16);
                let ms = base_ms.saturating_mul(1u64 << shift).min(max_ms);
                Duration::from_millis(ms)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt. Total attempts = 1 + attempts.
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 2,
            backoff: Backoff::Exponential {
                base_ms: 250,
                max_ms: 4_000,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive logical-call failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before allowing a probe.
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// What happens to a call that finds the agent's token bucket empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitPolicy {
    /// Wait for a token, up to `max_queue_wait_ms`.
    Queue,
    /// Fail the call immediately.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Sustained token refill rate per agent.
    pub calls_per_second: f64,
    /// Bucket capacity (maximum burst).
    pub burst: u32,
    pub policy: RateLimitPolicy,
    pub max_queue_wait_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            calls_per_second: 1.0,
            burst: 1,
            policy: RateLimitPolicy::Queue,
            max_queue_wait_ms: 10_000,
        }
    }
}

impl RateLimitConfig {
    pub fn max_queue_wait(&self) -> Duration {
        Duration::from_millis(self.max_queue_wait_ms)
    }
}

/// Geometric thresholds for table and figure detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Max vertical distance between span centres on the same row.
    pub row_tolerance: f64,
    /// Max horizontal distance between chunk starts in the same column bin.
    pub column_tolerance: f64,
    /// Horizontal gaps below this (as a multiple of span height) join spans into one cell.
    pub cell_gap_ratio: f64,
    /// Max vertical gap between consecutive rows of one table (multiple of median row height).
    pub max_row_gap_ratio: f64,
    pub min_rows: usize,
    pub min_columns: usize,
    /// Share of rows a column start must recur in.
    pub alignment_ratio: f64,
    /// Words needed for a chunk to count as a long prose run.
    pub prose_min_words: usize,
    pub prose_min_chars: usize,
    /// Minimum image area in page units.
    pub min_figure_area: f64,
    /// Overlap (share of the smaller region) above which two figures are duplicates.
    pub figure_overlap_ratio: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            row_tolerance: 3.0,
            column_tolerance: 8.0,
            cell_gap_ratio: 1.0,
            max_row_gap_ratio: 2.5,
            min_rows: 4,
            min_columns: 2,
            alignment_ratio: 0.70,
            prose_min_words: 5,
            prose_min_chars: 25,
            min_figure_area: 2_500.0,
            figure_overlap_ratio: 0.5,
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum candidate×agent calls in flight.
    pub max_concurrency: usize,
    /// Timeout of a single agent attempt.
    pub call_timeout_ms: u64,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub detection: DetectionConfig,
    /// Pages kept by the detection cache.
    pub page_cache_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            call_timeout_ms: 30_000,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            detection: DetectionConfig::default(),
            page_cache_capacity: 100,
        }
    }
}

impl PipelineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), EnhancementError> {
        if self.max_concurrency == 0 {
            return Err(EnhancementError::Config(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.call_timeout_ms == 0 {
            return Err(EnhancementError::Config(
                "call_timeout_ms must be positive".into(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(EnhancementError::Config(
                "circuit_breaker.failure_threshold must be at least 1".into(),
            ));
        }
        let rate = self.rate_limit.calls_per_second;
        if !rate.is_finite() || rate <= 0.0 {
            return Err(EnhancementError::Config(
                "rate_limit.calls_per_second must be a positive number".into(),
            ));
        }
        if self.rate_limit.burst == 0 {
            return Err(EnhancementError::Config(
                "rate_limit.burst must be at least 1".into(),
            ));
        }
        let ratio = self.detection.alignment_ratio;
        if ratio.is_nan() || ratio <= 0.0 || ratio > 1.0 {
            return Err(EnhancementError::Config(format!(
                "detection.alignment_ratio must be in (0, 1], got {ratio}"
            )));
        }
        if self.detection.min_rows < 2 || self.detection.min_columns < 2 {
            return Err(EnhancementError::Config(
                "detection.min_rows and detection.min_columns must be at least 2".into(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_concurrency, 5);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.reset_timeout_ms, 60_000);
        assert_eq!(config.detection.min_rows, 4);
        assert!((config.detection.alignment_ratio - 0.70).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_concurrency_rejected() {
        let config = PipelineConfig {
            max_concurrency: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(EnhancementError::Config(_))));
    }

    #[test]
    fn zero_threshold_rejected() {
        let mut config = PipelineConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn nan_rate_rejected() {
        let mut config = PipelineConfig::default();
        config.rate_limit.calls_per_second = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn alignment_ratio_out_of_range_rejected() {
        let mut config = PipelineConfig::default();
        config.detection.alignment_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn fixed_backoff_constant() {
        let b = Backoff::Fixed { delay_ms: 100 };
        assert_eq!(b.delay_for(1), Duration::from_millis(100));
        assert_eq!(b.delay_for(5), Duration::from_millis(100));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let b = Backoff::Exponential {
            base_ms: 100,
            max_ms: 500,
        };
        assert_eq!(b.delay_for(1), Duration::from_millis(100));
        assert_eq!(b.delay_for(2), Duration::from_millis(200));
        assert_eq!(b.delay_for(3), Duration::from_millis(400));
        assert_eq!(b.delay_for(4), Duration::from_millis(500));
        assert_eq!(b.delay_for(60), Duration::from_millis(500));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{"max_concurrency": 2, "rate_limit": {"policy": "reject"}}"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.rate_limit.policy, RateLimitPolicy::Reject);
        assert_eq!(config.rate_limit.burst, 1);
        assert_eq!(config.call_timeout_ms, 30_000);
    }

    #[test]
    fn backoff_serializes_tagged() {
        let json = serde_json::to_string(&Backoff::Fixed { delay_ms: 5 }).unwrap();
        assert_eq!(json, r#"{"kind":"fixed","delay_ms":5}"#);
    }
}
