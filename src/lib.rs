//! LLM API gateway with semantic caching, request coalescing and agent-run
//! analytics
//!
//! Sits between client applications and upstream model providers:
//! authenticates each caller against a per-project credential, serves
//! repeats from a semantic cache, coalesces identical concurrent requests
//! into one upstream call, and emits a normalized observability event per
//! request. A second ingestion path accepts agent-run traces, detects
//! anomalies and caching opportunities, and writes them to the same event
//! stream.

pub mod agent_runs;
pub mod analytics;
pub mod coalesce;
pub mod config;
pub mod credentials;
pub mod embedding;
pub mod error;
pub mod events;
pub mod metrics;
pub mod persistence;
pub mod pipeline;
pub mod pricing;
pub mod project_store;
pub mod sanitize;
pub mod semantic_cache;
pub mod server;
pub mod tuning;
pub mod upstream;
pub mod validation;
pub mod vector_store;

pub use agent_runs::{AgentRunIngestor, AgentRunInput, FlagDetector, IngestResponse};
pub use coalesce::{fingerprint, RequestCoalescer};
pub use config::GatewayConfig;
pub use credentials::{CredentialCipher, CredentialResolver, CredentialSource};
pub use error::GatewayError;
pub use events::{EventEmitter, EventSink, NormalizedEvent};
pub use pipeline::ProxyPipeline;
pub use pricing::PriceTable;
pub use project_store::{MemoryProjectStore, Project, ProjectStore, ProviderCredential};
pub use semantic_cache::{CacheDecision, SemanticCache};
pub use server::{build_router, build_state, run_server, AppState};
pub use tuning::ThresholdTuner;
pub use upstream::{ChatRequest, ChatResponse, Provider, Upstream, UpstreamRouter};
pub use vector_store::{MemoryVectorStore, NullVectorStore, VectorStore};
