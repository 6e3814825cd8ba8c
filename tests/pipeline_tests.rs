//! End-to-end pipeline behavior over in-memory collaborators

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{add_byok, add_project, chat_request, harness, MockUpstream};
use llm_gateway::config::PoolKeys;
use llm_gateway::embedding::{FixedEmbedder, HashEmbedder};
use llm_gateway::error::GatewayError;
use llm_gateway::events::EventStatus;
use llm_gateway::semantic_cache::CacheDecision;
use llm_gateway::upstream::Provider;

async fn settle() {
    // Let the emitter's drain task flush the queue.
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_paid_model_without_byok_is_rejected() {
    let h = harness(
        Arc::new(HashEmbedder::default()),
        Arc::new(MockUpstream::new("unused")),
        PoolKeys { openai: Some("pool".to_string()), ..Default::default() },
        Duration::from_secs(5),
    );
    let api_key = add_project(&h.store, "p1");

    let err = h
        .pipeline
        .chat(&api_key, chat_request("gpt-4o", "hello"))
        .await
        .err()
        .expect("paid model without BYOK must fail");

    match &err {
        GatewayError::PaidModelRequiresByok { model } => assert_eq!(model, "gpt-4o"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.to_string().starts_with("BYOK Required"));
    assert_eq!(err.status_code().as_u16(), 400);

    // No upstream call and no event carrying the prompt.
    assert_eq!(h.upstream.calls(), 0);
    settle().await;
    assert_eq!(h.sink.len().await, 0);
}

#[tokio::test]
async fn test_free_model_uses_the_pool() {
    let h = harness(
        Arc::new(HashEmbedder::default()),
        Arc::new(MockUpstream::new("pong")),
        PoolKeys { openrouter: Some("pool-key".to_string()), ..Default::default() },
        Duration::from_secs(5),
    );
    let api_key = add_project(&h.store, "p1");

    let response = h
        .pipeline
        .chat(&api_key, chat_request("mistralai/mistral-7b-instruct:free", "ping"))
        .await
        .unwrap();
    assert_eq!(response.content(), "pong");
    assert_eq!(h.upstream.calls(), 1);

    settle().await;
    let events = h.sink.all().await;
    assert_eq!(events.len(), 1);
    let event = &events[0].event;
    assert!(event.tags.iter().any(|t| t == "pool"));
    assert!(event.tags.iter().any(|t| t == "cache_decision:miss"));
    assert_eq!(event.cache_decision, CacheDecision::Miss);
}

#[tokio::test]
async fn test_exact_cache_hit_costs_nothing_and_skips_upstream() {
    let h = harness(
        Arc::new(HashEmbedder::default()),
        Arc::new(MockUpstream::new("four")),
        PoolKeys::default(),
        Duration::from_secs(5),
    );
    let api_key = add_project(&h.store, "p1");
    add_byok(&h.store, "p1", Provider::OpenAi, "sk-byok");

    let first = h
        .pipeline
        .chat(&api_key, chat_request("gpt-4o-mini", "What is 2+2?"))
        .await
        .unwrap();
    assert_eq!(h.upstream.calls(), 1);

    let second = h
        .pipeline
        .chat(&api_key, chat_request("gpt-4o-mini", "What is 2+2?"))
        .await
        .unwrap();
    assert_eq!(second.content(), first.content());
    // The cached response is served without a second upstream call.
    assert_eq!(h.upstream.calls(), 1);

    settle().await;
    let events = h.sink.all().await;
    assert_eq!(events.len(), 2);
    let hit = &events[1].event;
    assert_eq!(hit.cache_decision, CacheDecision::Exact);
    assert_eq!(hit.cost_usd, 0.0);
    let expected = h.pipeline.pricing().estimate("gpt-4o-mini", 100, 50);
    assert!((hit.potential_cost_usd - expected).abs() < 1e-12);
    assert!(expected > 0.0);
}

#[tokio::test]
async fn test_semantic_cache_hit_returns_seed_response() {
    // Seed and probe prompts embed to vectors with cosine similarity 0.97.
    let mut embedder = FixedEmbedder::new();
    embedder.insert("What is the capital of France?", vec![1.0, 0.0, 0.0]);
    embedder.insert("what's the capital of France", vec![0.97, 0.2431, 0.0]);

    let h = harness(
        Arc::new(embedder),
        Arc::new(MockUpstream::new("Paris")),
        PoolKeys::default(),
        Duration::from_secs(5),
    );
    let api_key = add_project(&h.store, "p1"); // threshold 0.95
    add_byok(&h.store, "p1", Provider::OpenAi, "sk-byok");

    let seeded = h
        .pipeline
        .chat(&api_key, chat_request("gpt-4o-mini", "What is the capital of France?"))
        .await
        .unwrap();
    assert_eq!(seeded.content(), "Paris");

    let hit = h
        .pipeline
        .chat(&api_key, chat_request("gpt-4o-mini", "what's the capital of France"))
        .await
        .unwrap();
    assert_eq!(hit.content(), "Paris");
    assert_eq!(h.upstream.calls(), 1);

    settle().await;
    let events = h.sink.all().await;
    let event = &events[1].event;
    assert_eq!(event.cache_decision, CacheDecision::Semantic);
    let similarity = event.cache_similarity.expect("semantic hits carry a similarity");
    assert!((similarity - 0.97).abs() < 0.01);
    assert_eq!(event.cost_usd, 0.0);
}

#[tokio::test]
async fn test_ten_identical_requests_coalesce_to_one_upstream_call() {
    let h = harness(
        Arc::new(HashEmbedder::default()),
        Arc::new(MockUpstream::new("shared").with_delay(Duration::from_millis(500))),
        PoolKeys::default(),
        Duration::from_secs(10),
    );
    let api_key = add_project(&h.store, "p1");
    add_byok(&h.store, "p1", Provider::OpenAi, "sk-byok");

    let mut handles = Vec::new();
    for _ in 0..10 {
        let pipeline = h.pipeline.clone();
        let api_key = api_key.clone();
        handles.push(tokio::spawn(async move {
            pipeline.chat(&api_key, chat_request("gpt-4o-mini", "same prompt")).await
        }));
    }

    let mut bodies = Vec::new();
    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        bodies.push(response.content().to_string());
    }

    assert_eq!(h.upstream.calls(), 1);
    assert!(bodies.iter().all(|b| b == "shared"));
    assert_eq!(h.pipeline.coalesce_snapshot().coalesced_requests, 9);

    settle().await;
    // Every request emits its own event; only the producer carries cost.
    let events = h.sink.all().await;
    assert_eq!(events.len(), 10);
    let paying: Vec<_> = events.iter().filter(|e| e.event.cost_usd > 0.0).collect();
    assert_eq!(paying.len(), 1);
}

#[tokio::test]
async fn test_upstream_error_is_surfaced_and_logged() {
    let h = harness(
        Arc::new(HashEmbedder::default()),
        Arc::new(MockUpstream::new("unused").failing(429)),
        PoolKeys::default(),
        Duration::from_secs(5),
    );
    let api_key = add_project(&h.store, "p1");
    add_byok(&h.store, "p1", Provider::OpenAi, "sk-byok");

    let err = h
        .pipeline
        .chat(&api_key, chat_request("gpt-4o-mini", "hello"))
        .await
        .err()
        .unwrap();
    match err {
        GatewayError::Upstream { status, .. } => assert_eq!(status, 429),
        other => panic!("unexpected error: {other:?}"),
    }

    settle().await;
    let events = h.sink.all().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event.status, EventStatus::Error);
    assert!(events[0].event.error_message.is_some());
}

#[tokio::test]
async fn test_deadline_expiry_times_out() {
    let h = harness(
        Arc::new(HashEmbedder::default()),
        Arc::new(MockUpstream::new("slow").with_delay(Duration::from_secs(30))),
        PoolKeys::default(),
        Duration::from_millis(200),
    );
    let api_key = add_project(&h.store, "p1");
    add_byok(&h.store, "p1", Provider::OpenAi, "sk-byok");

    let err = h
        .pipeline
        .chat(&api_key, chat_request("gpt-4o-mini", "hello"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, GatewayError::Timeout));
    assert_eq!(err.status_code().as_u16(), 504);

    settle().await;
    let events = h.sink.all().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event.status, EventStatus::Timeout);
}

#[tokio::test]
async fn test_invalid_api_key_is_unauthorized() {
    let h = harness(
        Arc::new(HashEmbedder::default()),
        Arc::new(MockUpstream::new("unused")),
        PoolKeys::default(),
        Duration::from_secs(5),
    );

    let err = h
        .pipeline
        .chat("sk-wrong", chat_request("gpt-4o-mini", "hello"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, GatewayError::Unauthorized(_)));
    assert_eq!(h.upstream.calls(), 0);
}

#[tokio::test]
async fn test_validation_rejects_before_any_io() {
    let h = harness(
        Arc::new(HashEmbedder::default()),
        Arc::new(MockUpstream::new("unused")),
        PoolKeys::default(),
        Duration::from_secs(5),
    );
    let api_key = add_project(&h.store, "p1");

    let mut request = chat_request("gpt-4o-mini", "hello");
    request.temperature = Some(5.0);
    let err = h.pipeline.chat(&api_key, request).await.err().unwrap();
    assert!(matches!(err, GatewayError::Validation(_)));

    let mut request = chat_request("gpt-4o-mini", "hello");
    request.messages.clear();
    assert!(h.pipeline.chat(&api_key, request).await.is_err());

    assert_eq!(h.upstream.calls(), 0);
    settle().await;
    assert_eq!(h.sink.len().await, 0);
}

#[tokio::test]
async fn test_completion_path_caches_under_its_own_partition() {
    let h = harness(
        Arc::new(HashEmbedder::default()),
        Arc::new(MockUpstream::new("completed text")),
        PoolKeys::default(),
        Duration::from_secs(5),
    );
    let api_key = add_project(&h.store, "p1");
    add_byok(&h.store, "p1", Provider::OpenAi, "sk-byok");

    let request = llm_gateway::upstream::CompletionRequest {
        model: "gpt-3.5-turbo".to_string(),
        prompt: "Once upon a time".to_string(),
        temperature: Some(0.7),
        max_tokens: Some(64),
        stop: None,
    };

    let first = h.pipeline.completion(&api_key, request.clone()).await.unwrap();
    assert_eq!(first.choices[0].text, "completed text");
    assert_eq!(h.upstream.calls(), 1);

    let second = h.pipeline.completion(&api_key, request).await.unwrap();
    assert_eq!(second.choices[0].text, "completed text");
    assert_eq!(h.upstream.calls(), 1);
}
