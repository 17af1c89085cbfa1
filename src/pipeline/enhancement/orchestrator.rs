//! Enhancement orchestrator: classify → route → bounded fan-out → consensus.
//!
//! Every candidate yields exactly one enhanced record, in input order, no
//! matter how its agent calls end. Only structurally invalid candidates or
//! an invalid configuration make the call return `Err`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use super::circuit_breaker::BreakerRegistry;
use super::classifier::RuleBasedClassifier;
use super::consensus::aggregate;
use super::error::EnhancementError;
use super::invoker::{Invocation, ResilientInvoker};
use super::rate_limit::RateLimiter;
use super::registry::AgentRegistry;
use super::stats::PipelineStatsCollector;
use super::traits::{AgentBackend, CandidateClassifier};
use super::types::{
    AgentRequest, AgentResult, Candidate, ClassifiedCandidate, EnhancedFigure, EnhancedTable,
    PipelineOutput,
};
use crate::pipeline::detection::{FigureCandidate, TableCandidate};
use crate::pipeline_config::PipelineConfig;

/// Cooperative cancellation flag shared between a caller and a running pipeline.
/// Once set, no new agent calls are dispatched; calls in flight run to completion.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    flag: Arc<AtomicBool>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Everything a pipeline run needs, passed in explicitly.
pub struct PipelineContext {
    pub config: PipelineConfig,
    pub backend: Arc<dyn AgentBackend>,
    pub registry: AgentRegistry,
    pub classifier: Arc<dyn CandidateClassifier>,
    /// Shared across runs so breaker state survives between calls.
    pub breakers: Arc<BreakerRegistry>,
    pub limiter: Arc<RateLimiter>,
}

impl PipelineContext {
    /// Default registry and classifier, fresh breaker and limiter state.
    pub fn new(config: PipelineConfig, backend: Arc<dyn AgentBackend>) -> Self {
        let breakers = Arc::new(BreakerRegistry::new(config.circuit_breaker.clone()));
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        Self {
            config,
            backend,
            registry: AgentRegistry::with_defaults(),
            classifier: Arc::new(RuleBasedClassifier),
            breakers,
            limiter,
        }
    }

    pub fn with_registry(mut self, registry: AgentRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn CandidateClassifier>) -> Self {
        self.classifier = classifier;
        self
    }
}

/// One candidate × agent call in flight.
struct Dispatched {
    candidate: usize,
    slot: usize,
    agent: String,
    handle: JoinHandle<Invocation>,
}

pub struct Orchestrator {
    ctx: PipelineContext,
    invoker: Arc<ResilientInvoker>,
}

impl Orchestrator {
    pub fn new(ctx: PipelineContext) -> Result<Self, EnhancementError> {
        ctx.config.validate()?;
        tracing::info!(
            agents = ?ctx.registry.agent_names(),
            max_concurrency = ctx.config.max_concurrency,
            "Enhancement orchestrator ready"
        );
        let invoker = Arc::new(ResilientInvoker::new(
            Arc::clone(&ctx.backend),
            Arc::clone(&ctx.breakers),
            Arc::clone(&ctx.limiter),
            &ctx.config,
        ));
        Ok(Self { ctx, invoker })
    }

    /// Circuit-breaker introspection.
    pub fn breakers(&self) -> &BreakerRegistry {
        &self.ctx.breakers
    }

    pub async fn process_extracted_data(
        &self,
        figures: &[FigureCandidate],
        tables: &[TableCandidate],
    ) -> Result<PipelineOutput, EnhancementError> {
        self.process_extracted_data_with_cancel(figures, tables, &CancellationSignal::new())
            .await
    }

    pub async fn process_extracted_data_with_cancel(
        &self,
        figures: &[FigureCandidate],
        tables: &[TableCandidate],
        cancel: &CancellationSignal,
    ) -> Result<PipelineOutput, EnhancementError> {
        if figures.is_empty() && tables.is_empty() {
            return Ok(PipelineOutput::default());
        }

        let candidates: Vec<Candidate> = figures
            .iter()
            .cloned()
            .map(Candidate::Figure)
            .chain(tables.iter().cloned().map(Candidate::Table))
            .collect();
        for candidate in &candidates {
            candidate.validate()?;
        }

        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("enhancement_run", %run_id);
        let output = self
            .run(candidates, figures.len(), tables.len(), cancel)
            .instrument(span)
            .await;
        Ok(output)
    }

    async fn run(
        &self,
        candidates: Vec<Candidate>,
        figure_count: usize,
        table_count: usize,
        cancel: &CancellationSignal,
    ) -> PipelineOutput {
        let classified: Vec<ClassifiedCandidate> = candidates
            .into_iter()
            .map(|c| self.ctx.classifier.classify(c))
            .collect();
        let routes: Vec<Vec<String>> = classified
            .iter()
            .map(|c| {
                self.ctx
                    .registry
                    .route(c.clinical_data_type, c.candidate.kind())
            })
            .collect();
        let pairings: usize = routes.iter().map(Vec::len).sum();

        tracing::info!(
            figures = figure_count,
            tables = table_count,
            pairings,
            max_concurrency = self.ctx.config.max_concurrency,
            "Enhancement pipeline started"
        );

        let mut stats = PipelineStatsCollector::new(table_count, figure_count);
        let dispatched = self.dispatch(&classified, &routes, cancel, &mut stats).await;

        let mut slots: Vec<Vec<Option<AgentResult>>> =
            routes.iter().map(|agents| vec![None; agents.len()]).collect();

        for call in dispatched {
            let page = classified[call.candidate].candidate.page_num();
            let candidate_id = classified[call.candidate].candidate.id();

            let invocation = match call.handle.await {
                Ok(invocation) => invocation,
                Err(join_err) => {
                    tracing::warn!(
                        agent = %call.agent,
                        candidate_id,
                        error = %join_err,
                        "Agent task aborted"
                    );
                    // The invoker's breaker guard already counted the failure while unwinding
                    Invocation {
                        result: Err(EnhancementError::AgentInvocation {
                            agent: call.agent.clone(),
                            reason: format!("agent task aborted: {join_err}"),
                            retryable: false,
                        }),
                        attempts: 1,
                        elapsed_ms: 0,
                    }
                }
            };
            stats.record_call(&invocation);

            slots[call.candidate][call.slot] = match invocation.result {
                Ok(result) => Some(result),
                Err(EnhancementError::Cancelled) if invocation.attempts == 0 => None,
                Err(e) => {
                    tracing::warn!(
                        agent = %call.agent,
                        candidate_id,
                        attempts = invocation.attempts,
                        error = %e,
                        "Agent call failed, recording failed result"
                    );
                    Some(AgentResult::failed(&call.agent, &e, invocation.elapsed_ms, page))
                }
            };
        }

        let mut output = PipelineOutput::default();
        for (classified, results) in classified.into_iter().zip(slots) {
            let results: Vec<AgentResult> = results.into_iter().flatten().collect();
            let enhancement = aggregate(results, classified.clinical_data_type);
            stats.record_enhancement(&enhancement);

            match classified.candidate {
                Candidate::Figure(figure) => output
                    .enhanced_figures
                    .push(EnhancedFigure { figure, enhancement }),
                Candidate::Table(table) => output
                    .enhanced_tables
                    .push(EnhancedTable { table, enhancement }),
            }
        }
        output.pipeline_stats = stats.finish();

        let s = &output.pipeline_stats;
        tracing::info!(
            agents_invoked = s.agents_invoked,
            calls_failed = s.calls_failed,
            calls_skipped = s.calls_skipped,
            total_processing_time_ms = s.total_processing_time_ms,
            average_confidence = s.average_confidence,
            "Enhancement pipeline complete"
        );
        output
    }

    /// Spawn every pairing in input order, at most `max_concurrency` at a time.
    /// Pairings reached after cancellation are counted as skipped.
    async fn dispatch(
        &self,
        classified: &[ClassifiedCandidate],
        routes: &[Vec<String>],
        cancel: &CancellationSignal,
        stats: &mut PipelineStatsCollector,
    ) -> Vec<Dispatched> {
        let semaphore = Arc::new(Semaphore::new(self.ctx.config.max_concurrency));
        let mut dispatched = Vec::new();

        for (i, (candidate, agents)) in classified.iter().zip(routes).enumerate() {
            let request = Arc::new(AgentRequest::from_classified(candidate));

            for (slot, agent) in agents.iter().enumerate() {
                if cancel.is_cancelled() {
                    stats.record_skipped();
                    continue;
                }
                let permit = match Arc::clone(&semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        stats.record_skipped();
                        continue;
                    }
                };
                // Cancellation may have arrived while waiting for a slot
                if cancel.is_cancelled() {
                    stats.record_skipped();
                    continue;
                }

                let invoker = Arc::clone(&self.invoker);
                let request = Arc::clone(&request);
                let agent_name = agent.clone();
                let cancel = cancel.clone();
                let handle = tokio::spawn(
                    async move {
                        let _permit = permit;
                        invoker.invoke(&agent_name, &request, &cancel).await
                    }
                    .in_current_span(),
                );

                dispatched.push(Dispatched {
                    candidate: i,
                    slot,
                    agent: agent.clone(),
                    handle,
                });
            }
        }

        if cancel.is_cancelled() {
            tracing::warn!(dispatched = dispatched.len(), "Pipeline cancelled, remaining calls skipped");
        }
        dispatched
    }
}
