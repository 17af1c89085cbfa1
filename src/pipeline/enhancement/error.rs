//! Error types for the enhancement stage.
//!
//! Per-candidate failures never escape the orchestrator as `Err`: they are
//! folded into failed `AgentResult`s. Only structurally invalid input and
//! configuration problems abort a whole pipeline call.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnhancementError {
    #[error("Agent '{agent}' failed: {reason}")]
    AgentInvocation {
        agent: String,
        reason: String,
        retryable: bool,
    },

    #[error("Agent '{agent}' timed out after {after_ms}ms")]
    Timeout { agent: String, after_ms: u64 },

    #[error("Circuit open for agent '{agent}', retry in {retry_in_ms}ms")]
    CircuitOpen { agent: String, retry_in_ms: u64 },

    #[error("Rate limit exceeded for agent '{agent}'")]
    RateLimited { agent: String },

    #[error("Enhancement cancelled")]
    Cancelled,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON parsing error: {0}")]
    JsonParsing(String),
}

/// Substrings marking transient upstream failures (quota, throttling, 5xx, timeouts).
const RETRYABLE_PATTERNS: &[&str] = &[
    "429",
    "quota",
    "rate",
    "resource exhausted",
    "500",
    "502",
    "503",
    "504",
    "unavailable",
    "overloaded",
    "timeout",
    "timed out",
    "deadline",
    "connection",
];

impl EnhancementError {
    /// Whether another attempt of the same logical call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EnhancementError::AgentInvocation { retryable, .. } => *retryable,
            EnhancementError::Timeout { .. } => true,
            EnhancementError::CircuitOpen { .. }
            | EnhancementError::RateLimited { .. }
            | EnhancementError::Cancelled
            | EnhancementError::InvalidInput(_)
            | EnhancementError::Config(_)
            | EnhancementError::JsonParsing(_) => false,
        }
    }

    /// Agent failure whose retryability is inferred from the message.
    pub fn agent_failure(agent: impl Into<String>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let retryable = is_retryable_message(&reason);
        EnhancementError::AgentInvocation {
            agent: agent.into(),
            reason,
            retryable,
        }
    }

    /// Whether this outcome says something about the agent's health.
    /// Rejections raised before the agent is contacted do not.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(
            self,
            EnhancementError::AgentInvocation { .. }
                | EnhancementError::Timeout { .. }
                | EnhancementError::JsonParsing(_)
        )
    }
}

/// Classify a free-form upstream error message as transient.
pub fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    RETRYABLE_PATTERNS.iter().any(|p| lower.contains(p))
}
