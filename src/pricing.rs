//! Static model price table and cost estimation

use std::collections::HashMap;

/// Per-model pricing in USD per 1K tokens.
#[derive(Clone, Debug)]
pub struct ModelPrice {
    pub prompt_per_1k: f64,
    pub completion_per_1k: f64,
}

/// Tag attached to events when a model has no price entry.
pub const UNKNOWN_MODEL_TAG: &str = "unknown_model_pricing";

/// Models the shared pool credential may be used for. Anything else requires
/// a project credential. OpenRouter free variants are matched by suffix.
const FREE_MODELS: &[&str] = &[
    "llama-3.1-8b-instant",
    "llama-3.3-70b-versatile",
    "gemma2-9b-it",
];

/// Cost estimator over a fixed price table.
#[derive(Clone)]
pub struct PriceTable {
    prices: HashMap<&'static str, ModelPrice>,
}

impl PriceTable {
    pub fn new() -> Self {
        let mut prices = HashMap::new();

        // OpenAI
        prices.insert("gpt-4o", ModelPrice { prompt_per_1k: 0.0025, completion_per_1k: 0.01 });
        prices.insert("gpt-4o-mini", ModelPrice { prompt_per_1k: 0.00015, completion_per_1k: 0.0006 });
        prices.insert("gpt-4-turbo", ModelPrice { prompt_per_1k: 0.01, completion_per_1k: 0.03 });
        prices.insert("gpt-3.5-turbo", ModelPrice { prompt_per_1k: 0.0005, completion_per_1k: 0.0015 });
        prices.insert("o1-mini", ModelPrice { prompt_per_1k: 0.003, completion_per_1k: 0.012 });

        // Anthropic
        prices.insert("claude-3-5-sonnet-20241022", ModelPrice { prompt_per_1k: 0.003, completion_per_1k: 0.015 });
        prices.insert("claude-3-5-haiku-20241022", ModelPrice { prompt_per_1k: 0.0008, completion_per_1k: 0.004 });
        prices.insert("claude-3-opus-20240229", ModelPrice { prompt_per_1k: 0.015, completion_per_1k: 0.075 });

        // Groq hosted models
        prices.insert("llama-3.1-8b-instant", ModelPrice { prompt_per_1k: 0.00005, completion_per_1k: 0.00008 });
        prices.insert("llama-3.3-70b-versatile", ModelPrice { prompt_per_1k: 0.00059, completion_per_1k: 0.00079 });
        prices.insert("mixtral-8x7b-32768", ModelPrice { prompt_per_1k: 0.00024, completion_per_1k: 0.00024 });
        prices.insert("gemma2-9b-it", ModelPrice { prompt_per_1k: 0.0002, completion_per_1k: 0.0002 });

        // OpenRouter aggregated models
        prices.insert("mistralai/mistral-7b-instruct", ModelPrice { prompt_per_1k: 0.00006, completion_per_1k: 0.00006 });
        prices.insert("mistralai/mistral-7b-instruct:free", ModelPrice { prompt_per_1k: 0.0, completion_per_1k: 0.0 });
        prices.insert("meta-llama/llama-3-8b-instruct", ModelPrice { prompt_per_1k: 0.00006, completion_per_1k: 0.00006 });
        prices.insert("deepseek/deepseek-chat", ModelPrice { prompt_per_1k: 0.00014, completion_per_1k: 0.00028 });

        Self { prices }
    }

    /// USD cost of a call. Unknown models cost 0; the caller is expected to
    /// tag the event with [`UNKNOWN_MODEL_TAG`].
    pub fn estimate(&self, model: &str, tokens_in: u32, tokens_out: u32) -> f64 {
        match self.prices.get(model) {
            Some(price) => {
                (tokens_in as f64 / 1000.0) * price.prompt_per_1k
                    + (tokens_out as f64 / 1000.0) * price.completion_per_1k
            }
            None => 0.0,
        }
    }

    pub fn is_known_model(&self, model: &str) -> bool {
        self.prices.contains_key(model)
    }

    /// Allowlisted models accepted on the request surface.
    pub fn allowed_models(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.prices.keys().copied()
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether the shared pool credential may serve this model.
pub fn is_free_model(model: &str) -> bool {
    model.ends_with(":free") || FREE_MODELS.contains(&model)
}

/// Coarse family tag for event grouping ("gpt", "claude", "llama", ...).
pub fn model_family(model: &str) -> &'static str {
    let base = model.rsplit('/').next().unwrap_or(model);
    if base.starts_with("gpt-") || base.starts_with("o1") {
        "gpt"
    } else if base.starts_with("claude-") {
        "claude"
    } else if base.starts_with("llama") {
        "llama"
    } else if base.starts_with("mixtral") || base.starts_with("mistral") {
        "mistral"
    } else if base.starts_with("gemma") {
        "gemma"
    } else if base.starts_with("deepseek") {
        "deepseek"
    } else {
        "other"
    }
}
