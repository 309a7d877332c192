use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Terminate the loop with `StoreUnavailable`.
    #[default]
    Abort,
    /// Keep going with the in-memory working context only.
    Degrade,
}

/// How a run turns the model's output into actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningStrategy {
    /// Think, act, observe until a final answer or the step bound.
    #[default]
    React,
    /// A numbered thought chain first, then at most one tool call.
    #[serde(alias = "cot")]
    ChainOfThought,
    /// Propose branches, score them, keep the best; then at most one tool call.
    #[serde(alias = "tot")]
    TreeOfThoughts,
}

impl ReasoningStrategy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "react" => Some(Self::React),
            "chain_of_thought" | "cot" => Some(Self::ChainOfThought),
            "tree_of_thoughts" | "tot" => Some(Self::TreeOfThoughts),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub max_steps: usize,
    pub context_window_turns: usize,
    pub gateway_timeout_ms: u64,
    pub max_gateway_retries: u32,
    pub retry_backoff_ms: u64,
    pub context_token_budget: usize,
    pub store_failure: StoreFailurePolicy,
    pub strategy: ReasoningStrategy,
    /// Thoughts kept from a chain-of-thought chain.
    pub cot_thoughts: usize,
    /// Candidates proposed per tree-of-thoughts level.
    pub tot_branches: usize,
    pub tot_depth: usize,
}

pub const MAX_RETRY_BACKOFF_MS: u64 = 8_000;

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_steps: 10,
            context_window_turns: 20,
            gateway_timeout_ms: 60_000,
            max_gateway_retries: 2,
            retry_backoff_ms: 250,
            context_token_budget: 6_000,
            store_failure: StoreFailurePolicy::Abort,
            strategy: ReasoningStrategy::React,
            cot_thoughts: 3,
            tot_branches: 3,
            tot_depth: 2,
        }
    }
}

impl LoopConfig {
    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_timeout_ms)
    }

    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor).min(MAX_RETRY_BACKOFF_MS))
    }
}

/// Request-scoped overrides; unset fields fall back to the service defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LoopConfigOverrides {
    pub max_steps: Option<usize>,
    pub context_window_turns: Option<usize>,
    pub gateway_timeout_ms: Option<u64>,
    pub max_gateway_retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub context_token_budget: Option<usize>,
    pub store_failure: Option<StoreFailurePolicy>,
    pub strategy: Option<ReasoningStrategy>,
    pub cot_thoughts: Option<usize>,
    pub tot_branches: Option<usize>,
    pub tot_depth: Option<usize>,
}

pub fn resolve_loop_config(defaults: &LoopConfig, request: &LoopConfigOverrides) -> LoopConfig {
    LoopConfig {
        max_steps: request.max_steps.unwrap_or(defaults.max_steps),
        context_window_turns: request.context_window_turns.unwrap_or(defaults.context_window_turns),
        gateway_timeout_ms: request.gateway_timeout_ms.unwrap_or(defaults.gateway_timeout_ms),
        max_gateway_retries: request.max_gateway_retries.unwrap_or(defaults.max_gateway_retries),
        retry_backoff_ms: request.retry_backoff_ms.unwrap_or(defaults.retry_backoff_ms),
        context_token_budget: request.context_token_budget.unwrap_or(defaults.context_token_budget),
        store_failure: request.store_failure.unwrap_or(defaults.store_failure),
        strategy: request.strategy.unwrap_or(defaults.strategy),
        cot_thoughts: request.cot_thoughts.unwrap_or(defaults.cot_thoughts),
        tot_branches: request.tot_branches.unwrap_or(defaults.tot_branches),
        tot_depth: request.tot_depth.unwrap_or(defaults.tot_depth),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelProvider {
    Ollama,
    OpenAi,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub provider: ModelProvider,
    pub ollama_host: String,
    pub ollama_model: String,
    pub openai_base_url: String,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub temperature: Option<f32>,
    pub database_url: Option<String>,
    pub fetch_allowlist: Vec<String>,
    /// Replaces the built-in ReAct system prompt when set.
    pub system_prompt: Option<String>,
    pub loop_defaults: LoopConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let provider = match get("MODEL_PROVIDER").as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("openai") => ModelProvider::OpenAi,
            _ => ModelProvider::Ollama,
        };
        let mut loop_defaults = LoopConfig::default();
        if let Some(n) = get("MAX_ITERATIONS").and_then(|v| v.parse().ok()) {
            loop_defaults.max_steps = n;
        }
        if let Some(secs) = get("AGENT_TIMEOUT").and_then(|v| v.parse::<u64>().ok()) {
            loop_defaults.gateway_timeout_ms = secs.saturating_mul(1000);
        }
        if let Some(strategy) = get("AGENT_STRATEGY").as_deref().and_then(ReasoningStrategy::parse) {
            loop_defaults.strategy = strategy;
        }
        let fetch_allowlist = get("FETCH_ALLOWLIST")
            .map(|v| v.split(',').map(|h| h.trim().to_string()).filter(|h| !h.is_empty()).collect())
            .unwrap_or_default();
        Self {
            provider,
            ollama_host: get("OLLAMA_HOST").unwrap_or_else(|| "http://localhost:11434".into()),
            ollama_model: get("OLLAMA_MODEL").unwrap_or_else(|| "llama3.1:8b".into()),
            openai_base_url: get("OPENAI_BASE_URL").unwrap_or_else(|| "https://api.openai.com/v1".into()),
            openai_api_key: get("OPENAI_API_KEY"),
            openai_model: get("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".into()),
            temperature: get("TEMPERATURE").and_then(|v| v.parse().ok()),
            database_url: get("DATABASE_URL"),
            fetch_allowlist,
            system_prompt: get("SYSTEM_PROMPT").filter(|p| !p.trim().is_empty()),
            loop_defaults,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn precedence_request_over_defaults() {
        let defaults = LoopConfig { max_steps: 4, context_token_budget: 1000, ..LoopConfig::default() };
        let request = LoopConfigOverrides {
            max_steps: Some(2),
            store_failure: Some(StoreFailurePolicy::Degrade),
            ..LoopConfigOverrides::default()
        };
        let eff = resolve_loop_config(&defaults, &request);
        assert_eq!(eff.max_steps, 2); // from request
        assert_eq!(eff.context_token_budget, 1000); // from defaults
        assert_eq!(eff.context_window_turns, 20);
        assert_eq!(eff.store_failure, StoreFailurePolicy::Degrade);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = LoopConfig { retry_backoff_ms: 100, ..LoopConfig::default() };
        assert_eq!(cfg.backoff_for(1), Duration::from_millis(100));
        assert_eq!(cfg.backoff_for(2), Duration::from_millis(200));
        assert_eq!(cfg.backoff_for(3), Duration::from_millis(400));
        assert_eq!(cfg.backoff_for(40), Duration::from_millis(MAX_RETRY_BACKOFF_MS));
    }

    #[test]
    fn app_config_reads_lookup() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("MODEL_PROVIDER", "OpenAI"),
            ("MAX_ITERATIONS", "3"),
            ("AGENT_TIMEOUT", "5"),
            ("FETCH_ALLOWLIST", "example.com, docs.rs ,"),
        ]);
        let cfg = AppConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.provider, ModelProvider::OpenAi);
        assert_eq!(cfg.loop_defaults.max_steps, 3);
        assert_eq!(cfg.loop_defaults.gateway_timeout_ms, 5000);
        assert_eq!(cfg.fetch_allowlist, vec!["example.com".to_string(), "docs.rs".to_string()]);
        assert_eq!(cfg.ollama_host, "http://localhost:11434");
        assert_eq!(cfg.system_prompt, None);
        assert_eq!(cfg.loop_defaults.strategy, ReasoningStrategy::React);
    }

    #[test]
    fn system_prompt_and_strategy_from_env() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SYSTEM_PROMPT", "You are terse."),
            ("AGENT_STRATEGY", "Tree-Of-Thoughts"),
        ]);
        let cfg = AppConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.system_prompt.as_deref(), Some("You are terse."));
        assert_eq!(cfg.loop_defaults.strategy, ReasoningStrategy::TreeOfThoughts);

        let blank: HashMap<&str, &str> = HashMap::from([("SYSTEM_PROMPT", "  "), ("AGENT_STRATEGY", "astrology")]);
        let cfg = AppConfig::from_lookup(|k| blank.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.system_prompt, None);
        assert_eq!(cfg.loop_defaults.strategy, ReasoningStrategy::React);
    }

    #[test]
    fn strategy_override_accepts_short_names() {
        let o: LoopConfigOverrides = serde_json::from_str(r#"{"strategy": "cot", "cot_thoughts": 5}"#).unwrap();
        let eff = resolve_loop_config(&LoopConfig::default(), &o);
        assert_eq!(eff.strategy, ReasoningStrategy::ChainOfThought);
        assert_eq!(eff.cot_thoughts, 5);
        assert_eq!(eff.tot_branches, 3);
    }

    #[test]
    fn loop_config_deserializes_partial_json() {
        let cfg: LoopConfig = serde_json::from_str(r#"{"max_steps": 3}"#).unwrap();
        assert_eq!(cfg.max_steps, 3);
        assert_eq!(cfg.max_gateway_retries, 2);
    }
}
