//! Multi-agent enhancement of detected candidates.
//!
//! ## Architecture
//!
//! ```text
//! tables + figures
//!        │
//!        ▼
//!   classifier ──► registry.route(data_type, kind) ──► [agent, …]
//!        │
//!        ▼
//!   orchestrator: Semaphore(max_concurrency) ── spawn ──► invoker
//!                                                          │
//!                      rate_limit → circuit_breaker → backend (timeout, retry)
//!        │
//!        ▼
//!   consensus::aggregate per candidate ──► stats ──► PipelineOutput
//! ```
//!
//! Breakers and rate-limit buckets are keyed by agent name and live in the
//! `PipelineContext`, so they persist across pipeline calls that share it.

pub mod error;
pub mod types;
pub mod traits;
pub mod classifier;
pub mod registry;
pub mod circuit_breaker;
pub mod rate_limit;
pub mod invoker;
pub mod consensus;
pub mod stats;
pub mod orchestrator;
pub mod http_agent;

pub use error::*;
pub use types::*;
pub use traits::*;
pub use classifier::{classify_candidate, RuleBasedClassifier};
pub use registry::AgentRegistry;
pub use circuit_breaker::{BreakerRegistry, CircuitBreaker, CircuitSnapshot, CircuitState};
pub use rate_limit::RateLimiter;
pub use invoker::{Invocation, ResilientInvoker};
pub use consensus::aggregate;
pub use stats::PipelineStatsCollector;
pub use orchestrator::{CancellationSignal, Orchestrator, PipelineContext};
pub use http_agent::{parse_json_strict, HttpAgentBackend};
