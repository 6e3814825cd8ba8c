//! Deterministic flag detection over a run's step sequence
//!
//! Detection is pure over the ordered step vector: the same run always
//! yields the same flag set regardless of when or how often it is
//! ingested. Detector order is fixed so the output is reproducible.

use async_trait::async_trait;
use std::collections::HashMap;

use super::jaccard_similarity;
use super::types::{AgentStep, Flag, FlagKind, StepType};
use crate::config::FlagThresholds;

/// Jaccard band in which two consecutive decisions count as a mutation of
/// the same prompt rather than a rewrite or a repeat.
const MUTATION_LOW: f64 = 0.30;
const MUTATION_HIGH: f64 = 0.95;

/// Where a step explanation came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExplanationSource {
    Deterministic,
    Llm,
}

impl ExplanationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deterministic => "deterministic",
            Self::Llm => "llm",
        }
    }
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct StepExplanation {
    pub step_index: usize,
    pub text: String,
    pub confidence: f64,
    pub source: ExplanationSource,
}

/// Optional LLM fallback consulted when the deterministic confidence is
/// below the project threshold.
#[async_trait]
pub trait LlmExplainer: Send + Sync {
    async fn explain(&self, step: &AgentStep) -> anyhow::Result<Option<String>>;
}

/// Explainer used when the LLM path is disabled.
pub struct NullLlmExplainer;

#[async_trait]
impl LlmExplainer for NullLlmExplainer {
    async fn explain(&self, _step: &AgentStep) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

pub struct FlagDetector {
    thresholds: FlagThresholds,
}

impl FlagDetector {
    pub fn new(thresholds: FlagThresholds) -> Self {
        Self { thresholds }
    }

    /// Run every detector in a fixed order.
    pub fn detect(&self, steps: &[AgentStep]) -> Vec<Flag> {
        let mut flags = Vec::new();
        self.detect_loops(steps, &mut flags);
        self.detect_high_cost(steps, &mut flags);
        self.detect_repeated_tools(steps, &mut flags);
        self.detect_empty_tool_output(steps, &mut flags);
        self.detect_error_fallback(steps, &mut flags);
        self.detect_cache_miss_retry(steps, &mut flags);
        self.detect_prompt_mutation(steps, &mut flags);
        flags
    }

    /// N or more occurrences of one step type inside the sliding window.
    /// One flag per offending type.
    fn detect_loops(&self, steps: &[AgentStep], flags: &mut Vec<Flag>) {
        let n = self.thresholds.loop_threshold;
        if n == 0 {
            return;
        }
        let window = chrono::Duration::from_std(self.thresholds.loop_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));

        let mut by_type: HashMap<StepType, Vec<&AgentStep>> = HashMap::new();
        for step in steps {
            by_type.entry(step.step_type).or_default().push(step);
        }

        let mut flagged: Vec<(usize, StepType)> = Vec::new();
        for (step_type, occurrences) in &by_type {
            if occurrences.len() < n {
                continue;
            }
            for window_start in 0..=(occurrences.len() - n) {
                let first = occurrences[window_start];
                let last = occurrences[window_start + n - 1];
                if last.timestamp - first.timestamp <= window {
                    flagged.push((first.step_index, *step_type));
                    break;
                }
            }
        }

        // HashMap iteration order is arbitrary; sort for a stable result.
        flagged.sort_by_key(|(index, _)| *index);
        for (index, step_type) in flagged {
            flags.push(Flag::new(
                FlagKind::LoopDetected,
                format!(
                    "{} occurred {} or more times within {}s",
                    step_type.as_str(),
                    n,
                    self.thresholds.loop_window.as_secs()
                ),
                Some(index),
            ));
        }
    }

    fn detect_high_cost(&self, steps: &[AgentStep], flags: &mut Vec<Flag>) {
        for step in steps {
            if step.cost() > self.thresholds.high_cost_usd {
                flags.push(Flag::new(
                    FlagKind::HighCostStep,
                    format!(
                        "step cost ${:.4} exceeds the ${:.2} threshold",
                        step.cost(),
                        self.thresholds.high_cost_usd
                    ),
                    Some(step.step_index),
                ));
            }
        }
    }

    fn detect_repeated_tools(&self, steps: &[AgentStep], flags: &mut Vec<Flag>) {
        let mut counts: Vec<(String, usize, usize)> = Vec::new();
        for step in steps {
            if step.step_type != StepType::ToolCall {
                continue;
            }
            let Some(tool) = &step.tool else { continue };
            match counts.iter_mut().find(|(name, _, _)| name == tool) {
                Some(entry) => entry.1 += 1,
                None => counts.push((tool.clone(), 1, step.step_index)),
            }
        }
        for (tool, count, first_index) in counts {
            if count >= self.thresholds.repeated_tool_threshold {
                flags.push(Flag::new(
                    FlagKind::RepeatedTool,
                    format!("tool \"{tool}\" called {count} times in one run"),
                    Some(first_index),
                ));
            }
        }
    }

    fn detect_empty_tool_output(&self, steps: &[AgentStep], flags: &mut Vec<Flag>) {
        for step in steps {
            if !matches!(step.step_type, StepType::ToolCall | StepType::ToolResult) {
                continue;
            }
            let empty = step
                .tool_output_summary
                .as_deref()
                .map_or(true, |s| s.trim().is_empty());
            if empty {
                flags.push(Flag::new(
                    FlagKind::EmptyToolOutput,
                    "tool produced no output summary",
                    Some(step.step_index),
                ));
            }
        }
    }

    fn detect_error_fallback(&self, steps: &[AgentStep], flags: &mut Vec<Flag>) {
        let has_error = steps.iter().any(|s| s.step_type == StepType::Error);
        let has_retry = steps.iter().any(|s| s.step_type == StepType::Retry);
        if has_error && has_retry {
            flags.push(Flag::new(
                FlagKind::ErrorFallback,
                "run recovered from an error by retrying",
                None,
            ));
        }
    }

    fn detect_cache_miss_retry(&self, steps: &[AgentStep], flags: &mut Vec<Flag>) {
        for step in steps {
            if step.step_type == StepType::Retry && step.cache_hit == Some(false) {
                flags.push(Flag::new(
                    FlagKind::CacheMissRetry,
                    "retry went upstream instead of hitting the cache",
                    Some(step.step_index),
                ));
            }
        }
    }

    /// Two adjacent decision steps whose raw payloads are similar but not
    /// near-identical: the agent is mutating its own prompt.
    fn detect_prompt_mutation(&self, steps: &[AgentStep], flags: &mut Vec<Flag>) {
        for pair in steps.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if a.step_type != StepType::Decision || b.step_type != StepType::Decision {
                continue;
            }
            let (Some(raw_a), Some(raw_b)) = (&a.raw, &b.raw) else { continue };
            let similarity = jaccard_similarity(raw_a, raw_b);
            if (MUTATION_LOW..MUTATION_HIGH).contains(&similarity) {
                flags.push(Flag::new(
                    FlagKind::PromptMutation,
                    format!("consecutive decisions rephrase the same prompt (similarity {similarity:.2})"),
                    Some(b.step_index),
                ));
            }
        }
    }

    /// Deterministic explanation for one step with its rule confidence.
    pub fn explain_step(&self, step: &AgentStep) -> (String, f64) {
        match step.step_type {
            StepType::UserInput => ("The user provided new input to the agent.".to_string(), 0.95),
            StepType::ToolCall => {
                let tool = step.tool.as_deref().unwrap_or("an unnamed tool");
                (format!("The agent invoked {tool} to gather information or act."), 0.85)
            }
            StepType::ToolResult => {
                ("A tool returned its result to the agent.".to_string(), 0.85)
            }
            StepType::ModelResponse => {
                ("The model produced a response for the current context.".to_string(), 0.80)
            }
            StepType::Error => {
                ("The step failed; see the raw payload for the error.".to_string(), 0.90)
            }
            StepType::Retry => {
                ("The agent retried a previously failed or unsatisfactory step.".to_string(), 0.90)
            }
            StepType::Decision => match &step.decision {
                Some(decision) if !decision.is_empty() => {
                    (format!("The agent decided: {decision}"), 0.75)
                }
                _ => ("The agent made an unrecorded routing decision.".to_string(), 0.50),
            },
        }
    }

    /// Explain every step, consulting the LLM only below the confidence
    /// threshold and only when the caller enables it.
    pub async fn explain_steps(
        &self,
        steps: &[AgentStep],
        llm: Option<&dyn LlmExplainer>,
    ) -> Vec<StepExplanation> {
        let mut explanations = Vec::with_capacity(steps.len());
        for step in steps {
            let (text, confidence) = self.explain_step(step);
            if confidence >= self.thresholds.explanation_confidence {
                explanations.push(StepExplanation {
                    step_index: step.step_index,
                    text,
                    confidence,
                    source: ExplanationSource::Deterministic,
                });
                continue;
            }

            let llm_text = match llm {
                Some(llm) => llm.explain(step).await.unwrap_or(None),
                None => None,
            };
            match llm_text {
                Some(text) => explanations.push(StepExplanation {
                    step_index: step.step_index,
                    text,
                    confidence,
                    source: ExplanationSource::Llm,
                }),
                // The low-confidence rule text is still better than nothing.
                None => explanations.push(StepExplanation {
                    step_index: step.step_index,
                    text,
                    confidence,
                    source: ExplanationSource::Deterministic,
                }),
            }
        }
        explanations
    }
}
