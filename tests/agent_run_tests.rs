//! Agent-run ingestion end to end: flags, attribution, idempotency

use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

use llm_gateway::agent_runs::{
    AgentRunIngestor, AgentRunInput, AgentStep, FlagDetector, FlagKind, RunStatus, Severity,
    StepType,
};
use llm_gateway::analytics::MemoryEventSink;
use llm_gateway::config::FlagThresholds;
use llm_gateway::error::GatewayError;
use llm_gateway::events::{EventEmitter, EventType};
use llm_gateway::persistence::PersistenceLayer;
use llm_gateway::project_store::{MemoryProjectStore, Project};
use llm_gateway::sanitize::Sanitizer;

struct Fixture {
    ingestor: AgentRunIngestor,
    sink: Arc<MemoryEventSink>,
    api_key: String,
    // Holds the SQLite file alive for the test's duration.
    _dir: tempfile::TempDir,
}

async fn fixture() -> Fixture {
    let dir = tempdir().unwrap();
    let store = Arc::new(MemoryProjectStore::new());
    store.add_project("sk-agent-test", Project::new("p1"));
    let sink = Arc::new(MemoryEventSink::new());
    let persistence = Arc::new(
        PersistenceLayer::new(dir.path().join("runs.db")).await.unwrap(),
    );

    let ingestor = AgentRunIngestor::new(
        store,
        persistence,
        EventEmitter::new(sink.clone(), 256),
        FlagDetector::new(FlagThresholds::default()),
        Sanitizer::new(2000),
        None,
        true,
    );

    Fixture { ingestor, sink, api_key: "sk-agent-test".to_string(), _dir: dir }
}

fn step(index: usize, seconds: i64, step_type: StepType) -> AgentStep {
    AgentStep {
        step_index: index,
        timestamp: Utc.timestamp_opt(seconds, 0).unwrap(),
        step_type,
        summary: Some(format!("step {index}")),
        decision: None,
        tool: None,
        tool_args: None,
        tool_output_summary: Some("ok".to_string()),
        raw: None,
        token_cost: Some(50),
        api_cost_usd: Some(0.001),
        cache_hit: Some(false),
    }
}

fn run(run_id: &str, steps: Vec<AgentStep>) -> AgentRunInput {
    AgentRunInput {
        run_id: run_id.to_string(),
        project_id: "p1".to_string(),
        agent_name: "researcher".to_string(),
        started_at: Utc.timestamp_opt(0, 0).unwrap(),
        ended_at: None,
        status: RunStatus::Completed,
        steps,
        user_id: None,
    }
}

#[tokio::test]
async fn test_loop_detection_on_rapid_retries() {
    let f = fixture().await;

    // Four retries at 0s, 2s, 4s, 6s.
    let steps: Vec<AgentStep> = (0..4).map(|i| step(i, i as i64 * 2, StepType::Retry)).collect();
    let response = f.ingestor.ingest(&f.api_key, run("run-loop", steps)).await.unwrap();

    assert!(response.success);
    let loop_flag = response
        .flags
        .iter()
        .find(|flag| flag.kind == FlagKind::LoopDetected)
        .expect("loop_detected flag");
    assert_eq!(loop_flag.severity, Severity::Error);
}

#[tokio::test]
async fn test_duplicate_tool_call_yields_one_opportunity() {
    let f = fixture().await;

    let mut first = step(0, 0, StepType::ToolCall);
    first.tool = Some("search".to_string());
    first.tool_args = Some(serde_json::json!({"q": "rust async"}));
    first.api_cost_usd = Some(0.01);
    let mut second = step(1, 120, StepType::ToolCall);
    second.tool = Some("search".to_string());
    second.tool_args = Some(serde_json::json!({"q": "rust async"}));
    second.api_cost_usd = Some(0.01);

    let response = f
        .ingestor
        .ingest(&f.api_key, run("run-opp", vec![first, second]))
        .await
        .unwrap();

    assert_eq!(response.caching_opportunities.len(), 1);
    let opp = &response.caching_opportunities[0];
    assert_eq!(opp.step_index, 1);
    assert_eq!(opp.reference_step_index, 0);
    assert!(opp.similarity >= 0.90);
    assert!((opp.saved_cost - 0.01).abs() < 1e-9);

    // The opportunity never claims more than the non-cached spend.
    assert!(opp.saved_cost <= response.summary.total_cost_usd);
}

#[tokio::test]
async fn test_reingestion_is_idempotent() {
    let f = fixture().await;
    let steps: Vec<AgentStep> = (0..4).map(|i| step(i, i as i64, StepType::Retry)).collect();

    let first = f
        .ingestor
        .ingest(&f.api_key, run("run-dup", steps.clone()))
        .await
        .unwrap();
    assert!(!first.deduplicated);

    let second = f.ingestor.ingest(&f.api_key, run("run-dup", steps)).await.unwrap();
    assert!(second.deduplicated);

    let first_kinds: Vec<FlagKind> = first.flags.iter().map(|f| f.kind).collect();
    let second_kinds: Vec<FlagKind> = second.flags.iter().map(|f| f.kind).collect();
    assert_eq!(first_kinds, second_kinds);
    assert_eq!(
        first.caching_opportunities.len(),
        second.caching_opportunities.len()
    );
}

#[tokio::test]
async fn test_noncontiguous_steps_rejected() {
    let f = fixture().await;
    let steps = vec![step(0, 0, StepType::ToolCall), step(2, 1, StepType::ToolCall)];

    let err = f.ingestor.ingest(&f.api_key, run("run-bad", steps)).await.err().unwrap();
    assert!(matches!(err, GatewayError::Validation(_)));
}

#[tokio::test]
async fn test_project_id_corrected_to_authenticated_project() {
    let f = fixture().await;
    let mut input = run("run-cross", vec![step(0, 0, StepType::ToolCall)]);
    input.project_id = "someone-elses-project".to_string();

    f.ingestor.ingest(&f.api_key, input).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = f.sink.all().await;
    assert_eq!(events.len(), 1);
    // The event lands under the key's project, never the claimed one.
    assert_eq!(events[0].event.project_id, "p1");
}

#[tokio::test]
async fn test_step_events_emitted_with_agent_tag() {
    let f = fixture().await;
    let steps = vec![step(0, 0, StepType::ToolCall), step(1, 1, StepType::ModelResponse)];
    f.ingestor.ingest(&f.api_key, run("run-events", steps)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = f.sink.all().await;
    assert_eq!(events.len(), 2);
    for stored in &events {
        assert_eq!(stored.event.event_type, EventType::AgentStep);
        assert_eq!(stored.event.run_id.as_deref(), Some("run-events"));
        assert!(stored.event.tags.iter().any(|t| t == "agent:researcher"));
    }
}

#[tokio::test]
async fn test_step_text_is_sanitized_before_persistence() {
    let f = fixture().await;
    let mut s = step(0, 0, StepType::ToolCall);
    s.tool = Some("http".to_string());
    s.summary = Some("calling api with api_key=sk-live-1234567890abcdef".to_string());
    s.tool_args = Some(serde_json::json!({"url": "https://example.com", "auth_token": "abc123"}));

    f.ingestor.ingest(&f.api_key, run("run-pii", vec![s])).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = f.sink.all().await;
    assert!(!events[0].event.prompt.contains("sk-live"));
    assert!(events[0].event.prompt.contains("[REDACTED]"));
}

#[tokio::test]
async fn test_wasted_spend_counts_retries_and_duplicates() {
    let f = fixture().await;

    let mut retry_step = step(1, 60, StepType::Retry);
    retry_step.api_cost_usd = Some(0.02);
    let steps = vec![step(0, 0, StepType::ModelResponse), retry_step];

    let response = f.ingestor.ingest(&f.api_key, run("run-waste", steps)).await.unwrap();
    assert!((response.summary.wasted_spend_usd - 0.02).abs() < 1e-9);
    assert!((response.summary.total_cost_usd - 0.021).abs() < 1e-9);
}

#[tokio::test]
async fn test_disabled_ingestor_returns_not_found() {
    let dir = tempdir().unwrap();
    let store = Arc::new(MemoryProjectStore::new());
    store.add_project("sk-x", Project::new("p1"));
    let sink = Arc::new(MemoryEventSink::new());
    let persistence = Arc::new(
        PersistenceLayer::new(dir.path().join("runs.db")).await.unwrap(),
    );
    let ingestor = AgentRunIngestor::new(
        store,
        persistence,
        EventEmitter::new(sink, 16),
        FlagDetector::new(FlagThresholds::default()),
        Sanitizer::new(2000),
        None,
        false,
    );

    let err = ingestor
        .ingest("sk-x", run("run-off", vec![step(0, 0, StepType::ToolCall)]))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, GatewayError::NotFound(_)));
}
