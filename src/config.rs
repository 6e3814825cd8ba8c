//! Gateway configuration loaded from the environment at startup
//!
//! All tunables live in one struct that is read once in `main` and passed
//! down by value. There is no live reload and no global mutable state.

use std::path::PathBuf;
use std::time::Duration;

/// Per-provider pool credentials used for free-tier models when a project
/// has no credential of its own.
#[derive(Debug, Clone, Default)]
pub struct PoolKeys {
    pub openai: Option<String>,
    pub anthropic: Option<String>,
    pub groq: Option<String>,
    pub openrouter: Option<String>,
}

/// Thresholds driving deterministic flag detection on agent runs.
#[derive(Debug, Clone)]
pub struct FlagThresholds {
    /// Occurrences of one step type inside the window that count as a loop.
    pub loop_threshold: usize,
    /// Sliding window for loop detection.
    pub loop_window: Duration,
    /// Single-step cost above which `high_cost_step` fires, in USD.
    pub high_cost_usd: f64,
    /// Calls to the same tool across a run that count as repetition.
    pub repeated_tool_threshold: usize,
    /// Minimum rule confidence before the deterministic explanation wins.
    pub explanation_confidence: f64,
}

impl Default for FlagThresholds {
    fn default() -> Self {
        Self {
            loop_threshold: 3,
            loop_window: Duration::from_secs(30),
            high_cost_usd: 0.05,
            repeated_tool_threshold: 3,
            explanation_confidence: 0.70,
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Passphrase the credential master key is derived from.
    pub master_secret: String,
    /// External project/API-key store. `None` selects the in-memory store.
    pub project_store_url: Option<String>,
    pub project_store_key: Option<String>,
    /// Embedding service for the semantic cache. `None` selects the local
    /// deterministic embedder.
    pub embedding_url: Option<String>,
    pub embedding_key: Option<String>,
    pub embedding_model: String,
    /// Analytics sink. `None` keeps events in memory.
    pub analytics_url: Option<String>,
    pub pool_keys: PoolKeys,
    pub agent_debugger_enabled: bool,
    pub llm_explainer_enabled: bool,
    pub flags: FlagThresholds,
    /// Maximum length of sanitized `raw` payloads, in characters.
    pub truncate_len: usize,
    /// Similarity threshold applied when a project has not set one.
    pub default_cache_threshold: f32,
    /// Overall per-request deadline.
    pub pipeline_deadline: Duration,
    /// Bound on the observability queue; full queue falls back to a direct
    /// sink write and then drops.
    pub event_queue_capacity: usize,
    pub exact_cache_capacity: u64,
    pub exact_cache_ttl: Duration,
    /// SQLite database holding agent runs and steps.
    pub database_path: PathBuf,
}

impl GatewayConfig {
    /// Read configuration from the environment, applying defaults for
    /// everything optional.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("GATEWAY_MASTER_SECRET") {
            cfg.master_secret = v;
        }
        cfg.project_store_url = std::env::var("GATEWAY_PROJECT_STORE_URL").ok();
        cfg.project_store_key = std::env::var("GATEWAY_PROJECT_STORE_KEY").ok();
        cfg.embedding_url = std::env::var("GATEWAY_EMBEDDING_URL").ok();
        cfg.embedding_key = std::env::var("GATEWAY_EMBEDDING_KEY").ok();
        if let Ok(v) = std::env::var("GATEWAY_EMBEDDING_MODEL") {
            cfg.embedding_model = v;
        }
        cfg.analytics_url = std::env::var("GATEWAY_ANALYTICS_URL").ok();

        cfg.pool_keys = PoolKeys {
            openai: std::env::var("GATEWAY_POOL_OPENAI_KEY").ok(),
            anthropic: std::env::var("GATEWAY_POOL_ANTHROPIC_KEY").ok(),
            groq: std::env::var("GATEWAY_POOL_GROQ_KEY").ok(),
            openrouter: std::env::var("GATEWAY_POOL_OPENROUTER_KEY").ok(),
        };

        cfg.agent_debugger_enabled = env_flag("GATEWAY_AGENT_DEBUGGER", true);
        cfg.llm_explainer_enabled = env_flag("GATEWAY_LLM_EXPLAINER", false);

        if let Some(v) = env_parse("GATEWAY_LOOP_THRESHOLD") {
            cfg.flags.loop_threshold = v;
        }
        if let Some(v) = env_parse::<u64>("GATEWAY_LOOP_WINDOW_SECS") {
            cfg.flags.loop_window = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("GATEWAY_HIGH_COST_USD") {
            cfg.flags.high_cost_usd = v;
        }
        if let Some(v) = env_parse("GATEWAY_REPEATED_TOOL_THRESHOLD") {
            cfg.flags.repeated_tool_threshold = v;
        }
        if let Some(v) = env_parse("GATEWAY_TRUNCATE_LEN") {
            cfg.truncate_len = v;
        }
        if let Some(v) = env_parse("GATEWAY_DEFAULT_CACHE_THRESHOLD") {
            cfg.default_cache_threshold = v;
        }
        if let Some(v) = env_parse::<u64>("GATEWAY_PIPELINE_DEADLINE_SECS") {
            cfg.pipeline_deadline = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("GATEWAY_EVENT_QUEUE_CAPACITY") {
            cfg.event_queue_capacity = v;
        }
        if let Ok(v) = std::env::var("GATEWAY_DATABASE_PATH") {
            cfg.database_path = PathBuf::from(v);
        }

        cfg
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let database_path = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".llm-gateway")
            .join("agent_runs.db");

        Self {
            master_secret: "llm-gateway-dev-secret".to_string(),
            project_store_url: None,
            project_store_key: None,
            embedding_url: None,
            embedding_key: None,
            embedding_model: "text-embedding-3-small".to_string(),
            analytics_url: None,
            pool_keys: PoolKeys::default(),
            agent_debugger_enabled: true,
            llm_explainer_enabled: false,
            flags: FlagThresholds::default(),
            truncate_len: 2000,
            default_cache_threshold: 0.95,
            pipeline_deadline: Duration::from_secs(60),
            event_queue_capacity: 1024,
            exact_cache_capacity: 100_000,
            exact_cache_ttl: Duration::from_secs(30 * 24 * 3600),
            database_path,
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.flags.loop_threshold, 3);
        assert_eq!(cfg.flags.loop_window, Duration::from_secs(30));
        assert!((cfg.flags.high_cost_usd - 0.05).abs() < f64::EPSILON);
        assert!((cfg.default_cache_threshold - 0.95).abs() < f32::EPSILON);
        assert_eq!(cfg.pipeline_deadline, Duration::from_secs(60));
        assert_eq!(cfg.truncate_len, 2000);
    }

    #[test]
    fn test_env_flag_parsing() {
        std::env::set_var("GATEWAY_TEST_FLAG_ON", "true");
        std::env::set_var("GATEWAY_TEST_FLAG_OFF", "0");
        assert!(env_flag("GATEWAY_TEST_FLAG_ON", false));
        assert!(!env_flag("GATEWAY_TEST_FLAG_OFF", true));
        assert!(env_flag("GATEWAY_TEST_FLAG_MISSING", true));
    }
}
