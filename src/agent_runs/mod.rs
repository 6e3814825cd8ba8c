//! Agent-run ingestion: validation, sanitization, flag detection, cost
//! attribution and persistence
//!
//! A run owns its steps as a vector indexed by `step_index`; flags and
//! caching opportunities carry indices into that vector, never pointers.

pub mod attribution;
pub mod flags;
pub mod ingest;
pub mod types;

pub use attribution::{detect_opportunities, summarize_costs};
pub use flags::{ExplanationSource, FlagDetector, LlmExplainer, NullLlmExplainer};
pub use ingest::{AgentRunIngestor, IngestResponse};
pub use types::{
    AgentRunInput, AgentStep, CachingOpportunity, CostSummary, Flag, FlagKind, RunStatus,
    Severity, StepType,
};

use std::collections::HashSet;

/// Jaccard similarity over lower-cased word sets. Two empty texts count as
/// identical.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let set_a: HashSet<String> = a.to_lowercase().split_whitespace().map(String::from).collect();
    let set_b: HashSet<String> = b.to_lowercase().split_whitespace().map(String::from).collect();

    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jaccard_identical_and_disjoint() {
        assert_eq!(jaccard_similarity("fetch the weather", "fetch the weather"), 1.0);
        assert_eq!(jaccard_similarity("alpha beta", "gamma delta"), 0.0);
        assert_eq!(jaccard_similarity("", ""), 1.0);
    }

    #[test]
    fn test_jaccard_partial_overlap() {
        // {a, b, c} vs {a, b, d}: 2 shared of 4 total.
        let sim = jaccard_similarity("a b c", "a b d");
        assert!((sim - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_jaccard_case_insensitive() {
        assert_eq!(jaccard_similarity("Fetch Weather", "fetch weather"), 1.0);
    }
}
