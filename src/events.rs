//! Normalized observability events and the non-blocking emitter
//!
//! Every proxied request and every ingested agent step produces one
//! `NormalizedEvent`. Emission must never block or fail the request path:
//! events go onto a bounded queue drained by a background task; if the queue
//! is full the emitter tries one direct sink write, and if that also fails
//! the event is dropped with a warning.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::semantic_cache::CacheDecision;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PromptCall,
    AgentStep,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Success,
    Error,
    Timeout,
}

/// One normalized observability record. Immutable once emitted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub event_id: String,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub model: String,
    pub prompt: String,
    pub response: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    /// Actual spend; zero whenever the response came from cache.
    pub cost_usd: f64,
    /// What the request would have cost uncached.
    pub potential_cost_usd: f64,
    pub latency_ms: u64,
    pub cache_decision: CacheDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_similarity: Option<f32>,
    pub status: EventStatus,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl NormalizedEvent {
    /// Skeleton with generated id and current timestamp; callers fill in the
    /// request-specific fields.
    pub fn new(project_id: impl Into<String>, event_type: EventType) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            run_id: None,
            timestamp: Utc::now(),
            event_type,
            model: String::new(),
            prompt: String::new(),
            response: String::new(),
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
            potential_cost_usd: 0.0,
            latency_ms: 0,
            cache_decision: CacheDecision::Miss,
            cache_similarity: None,
            status: EventStatus::Success,
            tags: Vec::new(),
            user_id: None,
            error_message: None,
        }
    }
}

/// A sink-side event record with its user-feedback flag.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event: NormalizedEvent,
    pub flagged: bool,
}

/// Destination for events, plus the reads the analytics surface and the
/// threshold tuner need.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn write_event(&self, event: &NormalizedEvent) -> anyhow::Result<()>;

    async fn fetch_event(
        &self,
        project_id: &str,
        event_id: &str,
    ) -> anyhow::Result<Option<StoredEvent>>;

    /// Mark an event as flagged-incorrect. Idempotent.
    async fn mark_flagged(&self, project_id: &str, event_id: &str) -> anyhow::Result<()>;

    /// Run one of the fixed analytics queries.
    async fn query(
        &self,
        project_id: &str,
        query: crate::analytics::AnalyticsQuery,
    ) -> anyhow::Result<serde_json::Value>;
}

/// Counters for the emitter itself.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct EmitterStats {
    pub emitted: u64,
    pub dropped: u64,
    pub fallback_writes: u64,
}

/// Queue-first event emitter with a direct-write fallback.
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::Sender<NormalizedEvent>,
    sink: Arc<dyn EventSink>,
    emitted: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    fallback_writes: Arc<AtomicU64>,
}

impl EventEmitter {
    /// Spawn the drain task and return the emitter handle.
    pub fn new(sink: Arc<dyn EventSink>, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<NormalizedEvent>(queue_capacity.max(1));

        let drain_sink = sink.clone();
        tokio::spawn(async move {
            let mut stream = ReceiverStream::new(rx);
            while let Some(event) = stream.next().await {
                if let Err(err) = drain_sink.write_event(&event).await {
                    warn!(event_id = %event.event_id, error = %err, "event sink write failed");
                }
            }
            debug!("event drain task stopped");
        });

        Self {
            tx,
            sink,
            emitted: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            fallback_writes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Hand off an event without ever blocking the caller.
    pub fn emit(&self, event: NormalizedEvent) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(err) => {
                // Queue saturated or drain task gone: one direct attempt,
                // then drop.
                let event = err.into_inner();
                let sink = self.sink.clone();
                let dropped = self.dropped.clone();
                let fallback_writes = self.fallback_writes.clone();
                tokio::spawn(async move {
                    match sink.write_event(&event).await {
                        Ok(()) => {
                            fallback_writes.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            dropped.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                event_id = %event.event_id,
                                error = %err,
                                "event dropped after queue and fallback both failed"
                            );
                        }
                    }
                });
            }
        }
    }

    pub fn stats(&self) -> EmitterStats {
        EmitterStats {
            emitted: self.emitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            fallback_writes: self.fallback_writes.load(Ordering::Relaxed),
        }
    }

    pub fn sink(&self) -> Arc<dyn EventSink> {
        self.sink.clone()
    }
}
