//! Cost attribution: totals, wasted spend and caching opportunities

use super::jaccard_similarity;
use super::types::{AgentStep, CachingOpportunity, CostSummary, StepType};

/// Similarity at or above which an earlier step's result would have served.
const OPPORTUNITY_THRESHOLD: f64 = 0.90;

/// Canonical comparable text for a step, by sub-class:
/// tool calls compare tool name plus arguments, model responses compare
/// their raw payload (falling back to the summary).
fn canonical_payload(step: &AgentStep) -> Option<String> {
    match step.step_type {
        StepType::ToolCall => {
            let tool = step.tool.as_deref()?;
            let args = step
                .tool_args
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_default();
            Some(format!("{tool} {args}"))
        }
        StepType::ModelResponse => step
            .raw
            .clone()
            .or_else(|| step.summary.clone()),
        _ => None,
    }
}

/// Identity used for the repeat-identical-tool-call waste rule: same tool,
/// same args, same output summary.
fn tool_call_identity(step: &AgentStep) -> Option<(String, String, String)> {
    if step.step_type != StepType::ToolCall {
        return None;
    }
    Some((
        step.tool.clone()?,
        step.tool_args.as_ref().map(|v| v.to_string()).unwrap_or_default(),
        step.tool_output_summary.clone().unwrap_or_default(),
    ))
}

/// Aggregate cost figures for one run.
pub fn summarize_costs(steps: &[AgentStep]) -> CostSummary {
    let total_cost_usd: f64 = steps.iter().map(|s| s.cost()).sum();

    let mut wasted_spend_usd = 0.0;
    let mut seen_tool_calls: Vec<(String, String, String)> = Vec::new();
    for step in steps {
        if step.step_type == StepType::Retry {
            wasted_spend_usd += step.cost();
            continue;
        }
        if let Some(identity) = tool_call_identity(step) {
            if seen_tool_calls.contains(&identity) {
                wasted_spend_usd += step.cost();
            } else {
                seen_tool_calls.push(identity);
            }
        }
    }

    let amount_saved_usd: f64 = steps
        .iter()
        .filter(|s| s.cache_hit == Some(true))
        .map(|s| s.cost())
        .sum();

    let cacheable_steps = steps.iter().filter(|s| s.step_type.cacheable()).count();
    let cache_hits = steps
        .iter()
        .filter(|s| s.step_type.cacheable() && s.cache_hit == Some(true))
        .count();
    let cache_hit_rate = if cacheable_steps > 0 {
        cache_hits as f64 / cacheable_steps as f64
    } else {
        0.0
    };

    CostSummary {
        total_cost_usd,
        wasted_spend_usd,
        amount_saved_usd,
        cache_hit_rate,
        cacheable_steps,
        cache_hits,
    }
}

/// Find non-cached tool calls and model responses an earlier step already
/// answered. Each step contributes at most one opportunity, pointing at its
/// first sufficiently similar predecessor.
pub fn detect_opportunities(steps: &[AgentStep]) -> Vec<CachingOpportunity> {
    let mut opportunities = Vec::new();

    for (i, step) in steps.iter().enumerate() {
        if !matches!(step.step_type, StepType::ToolCall | StepType::ModelResponse) {
            continue;
        }
        if step.cache_hit == Some(true) {
            continue;
        }
        let Some(payload) = canonical_payload(step) else { continue };

        for earlier in &steps[..i] {
            if earlier.step_type != step.step_type {
                continue;
            }
            // Tool calls only compare within the same tool.
            if step.step_type == StepType::ToolCall && earlier.tool != step.tool {
                continue;
            }
            let Some(earlier_payload) = canonical_payload(earlier) else { continue };

            let similarity = jaccard_similarity(&payload, &earlier_payload);
            if similarity >= OPPORTUNITY_THRESHOLD {
                opportunities.push(CachingOpportunity {
                    step_index: step.step_index,
                    reference_step_index: earlier.step_index,
                    similarity,
                    saved_cost: step.cost(),
                    message: match step.step_type {
                        StepType::ToolCall => format!(
                            "tool call repeats step {} and could be served from cache",
                            earlier.step_index
                        ),
                        _ => format!(
                            "model response repeats step {} and could be served from cache",
                            earlier.step_index
                        ),
                    },
                });
                break;
            }
        }
    }

    opportunities
}
