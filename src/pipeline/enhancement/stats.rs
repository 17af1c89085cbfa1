use super::error::EnhancementError;
use super::invoker::Invocation;
use super::types::{clamp_confidence, Enhancement, PipelineStats};

/// Run-level counters for one pipeline call.
#[derive(Debug, Default)]
pub struct PipelineStatsCollector {
    tables_processed: usize,
    figures_processed: usize,
    agents_invoked: usize,
    calls_failed: usize,
    calls_skipped: usize,
    total_processing_time_ms: u64,
    confidence_sum: f64,
    confident_candidates: usize,
}

impl PipelineStatsCollector {
    pub fn new(tables: usize, figures: usize) -> Self {
        Self {
            tables_processed: tables,
            figures_processed: figures,
            ..Self::default()
        }
    }

    /// Count one logical call. Calls cancelled before dispatch are skipped,
    /// not invoked.
    pub fn record_call(&mut self, invocation: &Invocation) {
        if invocation.attempts == 0 && matches!(invocation.result, Err(EnhancementError::Cancelled)) {
            self.calls_skipped += 1;
            return;
        }
        self.agents_invoked += 1;
        self.total_processing_time_ms = self
            .total_processing_time_ms
            .saturating_add(invocation.elapsed_ms);
        if invocation.result.is_err() {
            self.calls_failed += 1;
        }
    }

    /// A pairing never handed to the invoker.
    pub fn record_skipped(&mut self) {
        self.calls_skipped += 1;
    }

    /// Candidates with at least one validated result feed the average.
    pub fn record_enhancement(&mut self, enhancement: &Enhancement) {
        if enhancement.agent_results.iter().any(|r| r.is_validated()) {
            self.confidence_sum += clamp_confidence(enhancement.overall_confidence);
            self.confident_candidates += 1;
        }
    }

    pub fn finish(self) -> PipelineStats {
        let average_confidence = if self.confident_candidates == 0 {
            0.0
        } else {
            clamp_confidence(self.confidence_sum / self.confident_candidates as f64)
        };
        PipelineStats {
            total_processing_time_ms: self.total_processing_time_ms,
            agents_invoked: self.agents_invoked,
            tables_processed: self.tables_processed,
            figures_processed: self.figures_processed,
            average_confidence,
            calls_skipped: self.calls_skipped,
            calls_failed: self.calls_failed,
        }
    }
}
