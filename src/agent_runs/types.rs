//! Data model for ingested agent runs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    UserInput,
    Decision,
    ToolCall,
    ToolResult,
    ModelResponse,
    Error,
    Retry,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserInput => "user_input",
            Self::Decision => "decision",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::ModelResponse => "model_response",
            Self::Error => "error",
            Self::Retry => "retry",
        }
    }

    /// Step types whose results could have been served from a cache.
    pub fn cacheable(&self) -> bool {
        matches!(self, Self::ToolCall | Self::Decision | Self::ModelResponse)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One step of a run. Indices form a contiguous 0-based sequence and
/// timestamps never decrease; the ingestor rejects anything else.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentStep {
    pub step_index: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_output_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_cost: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_hit: Option<bool>,
}

impl AgentStep {
    pub fn cost(&self) -> f64 {
        self.api_cost_usd.unwrap_or(0.0)
    }
}

/// Inbound run payload. Steps are never mutated after ingestion; a replay
/// arrives under a new run id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentRunInput {
    pub run_id: String,
    pub project_id: String,
    pub agent_name: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub steps: Vec<AgentStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagKind {
    LoopDetected,
    HighCostStep,
    RepeatedTool,
    EmptyToolOutput,
    ErrorFallback,
    CacheMissRetry,
    PromptMutation,
}

impl FlagKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoopDetected => "loop_detected",
            Self::HighCostStep => "high_cost_step",
            Self::RepeatedTool => "repeated_tool",
            Self::EmptyToolOutput => "empty_tool_output",
            Self::ErrorFallback => "error_fallback",
            Self::CacheMissRetry => "cache_miss_retry",
            Self::PromptMutation => "prompt_mutation",
        }
    }

    /// Severity is a property of the flag kind, not of the occurrence.
    pub fn severity(&self) -> Severity {
        match self {
            Self::LoopDetected | Self::ErrorFallback => Severity::Error,
            Self::HighCostStep | Self::RepeatedTool | Self::EmptyToolOutput => Severity::Warning,
            Self::CacheMissRetry | Self::PromptMutation => Severity::Info,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Derived anomaly on a run or a single step. Never user-supplied.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Flag {
    #[serde(rename = "type")]
    pub kind: FlagKind,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
}

impl Flag {
    pub fn new(kind: FlagKind, message: impl Into<String>, step_index: Option<usize>) -> Self {
        Self { kind, severity: kind.severity(), message: message.into(), step_index }
    }
}

/// A non-cached step that an earlier step's result could have served.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CachingOpportunity {
    pub step_index: usize,
    pub reference_step_index: usize,
    pub similarity: f64,
    pub saved_cost: f64,
    pub message: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_cost_usd: f64,
    pub wasted_spend_usd: f64,
    pub amount_saved_usd: f64,
    pub cache_hit_rate: f64,
    pub cacheable_steps: usize,
    pub cache_hits: usize,
}
