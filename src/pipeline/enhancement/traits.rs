//! Trait definitions for the enhancement stage.
//!
//! - AgentBackend: the external analysis capability (one async call per agent)
//! - CandidateClassifier: labels candidates with a clinical data type

use async_trait::async_trait;

use super::error::EnhancementError;
use super::types::{AgentRequest, AgentResult, Candidate, ClassifiedCandidate};

/// Asynchronous, fallible analysis operation addressed by agent name.
/// Latency and failure modes are unknown; callers wrap every call in
/// timeout, retry and circuit-breaker protection.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn call_agent(
        &self,
        agent_name: &str,
        request: &AgentRequest,
    ) -> Result<AgentResult, EnhancementError>;
}

/// Pure labelling of a candidate. Never fails: ambiguity yields `Unknown`.
pub trait CandidateClassifier: Send + Sync {
    fn classify(&self, candidate: Candidate) -> ClassifiedCandidate;
}
