//! HTTP server: route table, handlers and component wiring
//!
//! `AppState` owns a handle to every component; handlers receive it via
//! axum's `State` extractor. All `/v1` endpoints require a bearer API key;
//! `/health` and `/metrics` are open operational endpoints.

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::agent_runs::{AgentRunIngestor, AgentRunInput, FlagDetector, NullLlmExplainer};
use crate::analytics::{AnalyticsQuery, HttpAnalyticsSink, MemoryEventSink};
use crate::config::GatewayConfig;
use crate::credentials::{CredentialCipher, CredentialResolver};
use crate::embedding::{Embedder, HashEmbedder, HttpEmbedder};
use crate::error::GatewayError;
use crate::events::{EventEmitter, EventSink};
use crate::metrics::GatewayMetrics;
use crate::persistence::PersistenceLayer;
use crate::pipeline::ProxyPipeline;
use crate::project_store::{HttpProjectStore, MemoryProjectStore, ProjectStore};
use crate::sanitize::Sanitizer;
use crate::semantic_cache::SemanticCache;
use crate::tuning::ThresholdTuner;
use crate::upstream::{ChatRequest, CompletionRequest, EmbeddingsRequest, UpstreamRouter};
use crate::validation::MAX_BODY_SIZE;
use crate::vector_store::MemoryVectorStore;

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ProxyPipeline>,
    pub ingestor: Arc<AgentRunIngestor>,
    pub tuner: Arc<ThresholdTuner>,
    pub sink: Arc<dyn EventSink>,
    pub metrics: Arc<GatewayMetrics>,
    pub start_time: Instant,
}

/// Extract the bearer API key from the Authorization header.
fn bearer_key(headers: &HeaderMap) -> Result<String, GatewayError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| GatewayError::Unauthorized("missing Authorization header".to_string()))?;
    value
        .strip_prefix("Bearer ")
        .map(|key| key.to_string())
        .ok_or_else(|| {
            GatewayError::Unauthorized("expected Authorization: Bearer <api_key>".to_string())
        })
}

// ---------------------------------------------------------------------------
// Proxy handlers
// ---------------------------------------------------------------------------

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Response, GatewayError> {
    let api_key = bearer_key(&headers)?;

    if request.is_streaming() {
        let stream = state.pipeline.chat_stream(&api_key, request).await?;
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(stream))
            .map_err(GatewayError::internal)?;
        return Ok(response);
    }

    let response = state.pipeline.chat(&api_key, request).await?;
    Ok(Json(response).into_response())
}

async fn completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CompletionRequest>,
) -> Result<Response, GatewayError> {
    let api_key = bearer_key(&headers)?;
    let response = state.pipeline.completion(&api_key, request).await?;
    Ok(Json(response).into_response())
}

async fn embeddings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<EmbeddingsRequest>,
) -> Result<Response, GatewayError> {
    let api_key = bearer_key(&headers)?;
    let response = state.pipeline.embeddings(&api_key, request).await?;
    Ok(Json(response).into_response())
}

async fn agent_runs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<AgentRunInput>,
) -> Result<Response, GatewayError> {
    let api_key = bearer_key(&headers)?;
    let response = state.ingestor.ingest(&api_key, input).await?;
    Ok(Json(response).into_response())
}

// ---------------------------------------------------------------------------
// Analytics handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AnalyticsParams {
    project_id: String,
    date_from: Option<DateTime<Utc>>,
    date_to: Option<DateTime<Utc>>,
    limit: Option<usize>,
}

/// Authenticate the bearer key and require it to own the queried project.
async fn authorize_project(
    state: &AppState,
    headers: &HeaderMap,
    project_id: &str,
) -> Result<(), GatewayError> {
    let api_key = bearer_key(headers)?;
    let project = state.pipeline.authenticate(&api_key).await?;
    if project.id != project_id {
        return Err(GatewayError::Forbidden(
            "project_id does not match the authenticated project".to_string(),
        ));
    }
    Ok(())
}

async fn run_query(
    state: &AppState,
    headers: &HeaderMap,
    params: &AnalyticsParams,
    query: AnalyticsQuery,
) -> Result<Response, GatewayError> {
    authorize_project(state, headers, &params.project_id).await?;
    let value = state
        .sink
        .query(&params.project_id, query)
        .await
        .map_err(GatewayError::internal)?;
    Ok(Json(value).into_response())
}

async fn analytics_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<AnalyticsParams>,
) -> Result<Response, GatewayError> {
    let query = AnalyticsQuery::Stats { date_from: params.date_from, date_to: params.date_to };
    run_query(&state, &headers, &params, query).await
}

async fn analytics_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<AnalyticsParams>,
) -> Result<Response, GatewayError> {
    let query = AnalyticsQuery::Logs { limit: params.limit.unwrap_or(100).min(1000) };
    run_query(&state, &headers, &params, query).await
}

async fn analytics_timeseries(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<AnalyticsParams>,
) -> Result<Response, GatewayError> {
    let query =
        AnalyticsQuery::Timeseries { date_from: params.date_from, date_to: params.date_to };
    run_query(&state, &headers, &params, query).await
}

async fn analytics_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(event_id): Path<String>,
    Query(params): Query<AnalyticsParams>,
) -> Result<Response, GatewayError> {
    authorize_project(&state, &headers, &params.project_id).await?;
    let stored = state
        .sink
        .fetch_event(&params.project_id, &event_id)
        .await
        .map_err(GatewayError::internal)?
        .ok_or_else(|| GatewayError::NotFound(format!("event {event_id} not found")))?;
    Ok(Json(stored).into_response())
}

async fn analytics_flag_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(event_id): Path<String>,
    Query(params): Query<AnalyticsParams>,
) -> Result<Response, GatewayError> {
    authorize_project(&state, &headers, &params.project_id).await?;
    let outcome = state.tuner.flag_incorrect(&params.project_id, &event_id).await?;
    Ok(Json(outcome).into_response())
}

async fn analytics_agents(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<AnalyticsParams>,
) -> Result<Response, GatewayError> {
    run_query(&state, &headers, &params, AnalyticsQuery::Agents).await
}

async fn analytics_agent_detail(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Query(params): Query<AnalyticsParams>,
) -> Result<Response, GatewayError> {
    run_query(&state, &headers, &params, AnalyticsQuery::AgentDetail { name }).await
}

async fn analytics_agent_timeseries(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Query(params): Query<AnalyticsParams>,
) -> Result<Response, GatewayError> {
    run_query(&state, &headers, &params, AnalyticsQuery::AgentTimeseries { name }).await
}

async fn analytics_roi(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<AnalyticsParams>,
) -> Result<Response, GatewayError> {
    run_query(&state, &headers, &params, AnalyticsQuery::RoiReport).await
}

async fn analytics_coalescing(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<AnalyticsParams>,
) -> Result<Response, GatewayError> {
    authorize_project(&state, &headers, &params.project_id).await?;
    Ok(Json(state.pipeline.coalesce_snapshot()).into_response())
}

async fn analytics_streaming(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<AnalyticsParams>,
) -> Result<Response, GatewayError> {
    run_query(&state, &headers, &params, AnalyticsQuery::Streaming).await
}

// ---------------------------------------------------------------------------
// Operational handlers
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.gather(),
    )
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/agent-runs", post(agent_runs))
        .route("/v1/analytics/stats", get(analytics_stats))
        .route("/v1/analytics/logs", get(analytics_logs))
        .route("/v1/analytics/timeseries", get(analytics_timeseries))
        .route("/v1/analytics/event/:id", get(analytics_event))
        .route("/v1/analytics/event/:id/flag", post(analytics_flag_event))
        .route("/v1/analytics/agents", get(analytics_agents))
        .route("/v1/analytics/agents/:name", get(analytics_agent_detail))
        .route(
            "/v1/analytics/agents/:name/timeseries",
            get(analytics_agent_timeseries),
        )
        .route("/v1/analytics/roi-report", get(analytics_roi))
        .route("/v1/analytics/coalescing", get(analytics_coalescing))
        .route("/v1/analytics/streaming", get(analytics_streaming))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wire every component from configuration.
pub async fn build_state(config: &GatewayConfig) -> anyhow::Result<AppState> {
    let client = reqwest::Client::new();

    let store: Arc<dyn ProjectStore> = match &config.project_store_url {
        Some(url) => {
            info!("project store: {url}");
            Arc::new(HttpProjectStore::new(
                client.clone(),
                url,
                config.project_store_key.clone(),
            )?)
        }
        None => {
            warn!("no project store configured; using the in-memory store");
            Arc::new(MemoryProjectStore::new())
        }
    };

    let embedder: Arc<dyn Embedder> = match &config.embedding_url {
        Some(url) => {
            info!("embedding service: {url}");
            Arc::new(HttpEmbedder::new(
                client.clone(),
                url.clone(),
                config.embedding_key.clone(),
                config.embedding_model.clone(),
            ))
        }
        None => {
            warn!("no embedding service configured; using the local embedder");
            Arc::new(HashEmbedder::default())
        }
    };

    let sink: Arc<dyn EventSink> = match &config.analytics_url {
        Some(url) => {
            info!("analytics sink: {url}");
            Arc::new(HttpAnalyticsSink::new(client.clone(), url)?)
        }
        None => {
            warn!("no analytics sink configured; keeping events in memory");
            Arc::new(MemoryEventSink::new())
        }
    };

    let metrics = Arc::new(GatewayMetrics::new()?);
    let emitter = EventEmitter::new(sink.clone(), config.event_queue_capacity);

    let cipher = CredentialCipher::from_passphrase(&config.master_secret);
    let resolver = CredentialResolver::new(store.clone(), cipher, config.pool_keys.clone());

    let cache = SemanticCache::new(
        embedder,
        Arc::new(MemoryVectorStore::new()),
        config.exact_cache_capacity,
        config.exact_cache_ttl,
        config.truncate_len,
    );

    let upstream = Arc::new(UpstreamRouter::new(client));

    let pipeline = Arc::new(ProxyPipeline::new(
        store.clone(),
        resolver,
        cache,
        upstream,
        emitter.clone(),
        metrics.clone(),
        config.pipeline_deadline,
        config.truncate_len,
    ));

    let persistence = Arc::new(PersistenceLayer::new(&config.database_path).await?);
    match persistence.cleanup_old_runs(30).await {
        Ok(deleted) if deleted > 0 => info!("cleaned up {deleted} expired agent runs"),
        Ok(_) => {}
        Err(err) => warn!(error = %err, "agent run cleanup failed"),
    }

    let ingestor = Arc::new(AgentRunIngestor::new(
        store.clone(),
        persistence,
        emitter,
        FlagDetector::new(config.flags.clone()),
        Sanitizer::new(config.truncate_len),
        config
            .llm_explainer_enabled
            .then(|| Arc::new(NullLlmExplainer) as Arc<dyn crate::agent_runs::LlmExplainer>),
        config.agent_debugger_enabled,
    ));

    let tuner = Arc::new(ThresholdTuner::new(store, sink.clone()));

    Ok(AppState {
        pipeline,
        ingestor,
        tuner,
        sink,
        metrics,
        start_time: Instant::now(),
    })
}

/// Start the gateway and serve until ctrl-c.
pub async fn run_server(config: GatewayConfig, host: &str, port: u16) -> anyhow::Result<()> {
    let state = build_state(&config).await?;
    let router = build_router(state);

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("gateway listening on {addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
    }
}
