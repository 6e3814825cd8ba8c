//! Agent-run ingestion pipeline
//!
//! validate -> sanitize -> detect -> attribute -> persist -> emit, in that
//! order. Ingestion is idempotent on (project, run_id): replaying a payload
//! returns the originally derived flags without writing anything.

use std::sync::Arc;
use tracing::{debug, warn};

use super::attribution::{detect_opportunities, summarize_costs};
use super::flags::{FlagDetector, LlmExplainer};
use super::types::{AgentRunInput, AgentStep, CachingOpportunity, CostSummary, Flag};
use crate::analytics::AGENT_TAG_PREFIX;
use crate::error::GatewayError;
use crate::events::{EventEmitter, EventType, NormalizedEvent};
use crate::persistence::{PersistenceLayer, RunRecord};
use crate::project_store::ProjectStore;
use crate::sanitize::Sanitizer;
use crate::semantic_cache::CacheDecision;

/// Response body for `POST /v1/agent-runs`.
#[derive(Clone, Debug, serde::Serialize)]
pub struct IngestResponse {
    pub success: bool,
    pub run_id: String,
    pub flags: Vec<Flag>,
    pub summary: CostSummary,
    pub caching_opportunities: Vec<CachingOpportunity>,
    /// True when this payload had already been ingested.
    pub deduplicated: bool,
}

pub struct AgentRunIngestor {
    store: Arc<dyn ProjectStore>,
    persistence: Arc<PersistenceLayer>,
    emitter: EventEmitter,
    detector: FlagDetector,
    sanitizer: Sanitizer,
    llm_explainer: Option<Arc<dyn LlmExplainer>>,
    enabled: bool,
}

impl AgentRunIngestor {
    pub fn new(
        store: Arc<dyn ProjectStore>,
        persistence: Arc<PersistenceLayer>,
        emitter: EventEmitter,
        detector: FlagDetector,
        sanitizer: Sanitizer,
        llm_explainer: Option<Arc<dyn LlmExplainer>>,
        enabled: bool,
    ) -> Self {
        Self { store, persistence, emitter, detector, sanitizer, llm_explainer, enabled }
    }

    pub async fn ingest(
        &self,
        api_key: &str,
        mut input: AgentRunInput,
    ) -> Result<IngestResponse, GatewayError> {
        if !self.enabled {
            return Err(GatewayError::NotFound("agent debugger is disabled".to_string()));
        }

        let project = self.store.authenticate(api_key).await?;
        if input.project_id != project.id {
            // The key decides the project; the payload's id is corrected to
            // it, never the other way around.
            warn!(
                claimed = %input.project_id,
                actual = %project.id,
                "agent run project id corrected to authenticated project"
            );
            input.project_id = project.id.clone();
        }

        validate_steps(&input.steps)?;
        input.steps.sort_by_key(|s| s.step_index);

        for step in &mut input.steps {
            self.sanitize_step(step);
        }

        let flags = self.detector.detect(&input.steps);
        let summary = summarize_costs(&input.steps);
        let opportunities = detect_opportunities(&input.steps);
        let explanations = self
            .detector
            .explain_steps(&input.steps, self.llm_explainer.as_deref())
            .await;

        let inserted = self
            .persistence
            .insert_run(RunRecord {
                project_id: &input.project_id,
                run_id: &input.run_id,
                agent_name: &input.agent_name,
                started_at: input.started_at,
                ended_at: input.ended_at,
                status: input.status,
                user_id: input.user_id.as_deref(),
                summary: &summary,
                flags: &flags,
                opportunities: &opportunities,
                steps: &input.steps,
                explanations: &explanations,
            })
            .await
            .map_err(GatewayError::internal)?;

        if !inserted {
            // Same payload, same derivation: return the stored result.
            let stored = self
                .persistence
                .get_run(&input.project_id, &input.run_id)
                .await
                .map_err(GatewayError::internal)?
                .ok_or_else(|| {
                    GatewayError::Internal("run vanished between insert and read".to_string())
                })?;
            debug!(run_id = %input.run_id, "duplicate agent run ingested, returning stored flags");
            return Ok(IngestResponse {
                success: true,
                run_id: stored.run_id,
                flags: stored.flags,
                summary: stored.summary,
                caching_opportunities: stored.opportunities,
                deduplicated: true,
            });
        }

        for step in &input.steps {
            self.emitter.emit(self.step_event(&input, step));
        }

        debug!(
            run_id = %input.run_id,
            steps = input.steps.len(),
            flags = flags.len(),
            "agent run ingested"
        );

        Ok(IngestResponse {
            success: true,
            run_id: input.run_id,
            flags,
            summary,
            caching_opportunities: opportunities,
            deduplicated: false,
        })
    }

    fn sanitize_step(&self, step: &mut AgentStep) {
        step.summary = self.sanitizer.sanitize_opt(step.summary.as_deref());
        step.decision = self.sanitizer.sanitize_opt(step.decision.as_deref());
        step.tool_output_summary = self.sanitizer.sanitize_opt(step.tool_output_summary.as_deref());
        if let Some(raw) = step.raw.as_deref() {
            step.raw = Some(self.sanitizer.sanitize_raw(raw).0);
        }
        if let Some(args) = &step.tool_args {
            step.tool_args = Some(self.sanitizer.sanitize_json(args));
        }
    }

    fn step_event(&self, run: &AgentRunInput, step: &AgentStep) -> NormalizedEvent {
        let cost = step.cost();
        let cached = step.cache_hit == Some(true);

        let mut event = NormalizedEvent::new(&run.project_id, EventType::AgentStep);
        event.run_id = Some(run.run_id.clone());
        event.timestamp = step.timestamp;
        event.prompt = step.summary.clone().unwrap_or_default();
        event.response = step.tool_output_summary.clone().unwrap_or_default();
        event.tokens_in = step.token_cost.unwrap_or(0).min(u32::MAX as u64) as u32;
        event.cost_usd = if cached { 0.0 } else { cost };
        event.potential_cost_usd = cost;
        event.cache_decision = if cached { CacheDecision::Exact } else { CacheDecision::Miss };
        event.user_id = run.user_id.clone();
        event.tags = vec![
            format!("{AGENT_TAG_PREFIX}{}", run.agent_name),
            format!("step_type:{}", step.step_type.as_str()),
        ];
        event
    }
}

/// Indices must form exactly {0..N-1} and timestamps must never decrease.
fn validate_steps(steps: &[AgentStep]) -> Result<(), GatewayError> {
    let mut seen = vec![false; steps.len()];
    for step in steps {
        if step.step_index >= steps.len() || seen[step.step_index] {
            return Err(GatewayError::Validation(format!(
                "step indices must form a contiguous 0-based sequence (bad index {})",
                step.step_index
            )));
        }
        seen[step.step_index] = true;
    }

    let mut ordered: Vec<&AgentStep> = steps.iter().collect();
    ordered.sort_by_key(|s| s.step_index);
    for pair in ordered.windows(2) {
        if pair[1].timestamp < pair[0].timestamp {
            return Err(GatewayError::Validation(
                "step timestamps must be monotonically non-decreasing".to_string(),
            ));
        }
    }
    Ok(())
}
