use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Typed validation failures for [`ExperimentConfig::validate`], the
/// synchronous configuration-error tier of §7: surfaced at `start`, before
/// an experiment is ever created. Composed into `anyhow::Error` at the
/// Runner/CLI/Control-API boundary the same way `drift-gateway::GatewayError`
/// and `drift-runtime::StateError` are.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("reward weights must be non-negative")]
    NegativeRewardWeight,
    #[error("reward weights must sum to a positive number")]
    NonPositiveWeightSum,
    #[error("epsilon must be in [0, 1], got {0}")]
    EpsilonOutOfRange(f32),
}

/// Per-role settings for a single model endpoint (agent or judge).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelRoleConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for ModelRoleConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            api_key: String::new(),
            model: "llama3.1:8b".to_string(),
            temperature: 0.7,
            max_tokens: 512,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub agent: ModelRoleConfig,
    pub judge: ModelRoleConfig,
    pub embedding_model: String,
    pub retry_attempts: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_backoff_factor: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let mut judge = ModelRoleConfig::default();
        judge.temperature = 0.3;
        Self {
            agent: ModelRoleConfig::default(),
            judge,
            embedding_model: "nomic-embed-text".to_string(),
            retry_attempts: 3,
            retry_initial_backoff_ms: 200,
            retry_backoff_factor: 2,
        }
    }
}

/// Reward weight preset: short-term, long-term, and violation multipliers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RewardWeights {
    pub short_term: f32,
    pub long_term: f32,
    pub violation: f32,
}

impl RewardWeights {
    pub const fn baseline() -> Self {
        Self { short_term: 0.5, long_term: 0.5, violation: 1.0 }
    }

    pub const fn induced() -> Self {
        Self { short_term: 0.8, long_term: 0.2, violation: 1.0 }
    }

    pub const fn defense() -> Self {
        Self { short_term: 0.2, long_term: 0.8, violation: 2.0 }
    }

    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "baseline" => Some(Self::baseline()),
            "induced" => Some(Self::induced()),
            "defense" => Some(Self::defense()),
            _ => None,
        }
    }
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self::baseline()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    pub max_size: usize,
    pub similarity_threshold: f32,
    pub top_k: usize,
    pub embedding_cache_enabled: bool,
    pub embedding_cache_capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 1000,
            similarity_threshold: 0.7,
            top_k: 5,
            embedding_cache_enabled: true,
            embedding_cache_capacity: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub epsilon: f32,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self { epsilon: 0.1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewerConfig {
    pub enabled: bool,
    pub strict_mode: bool,
    pub model_tier_enabled: bool,
    /// When true, a CRITICAL review is routed to the reserved ESCALATE
    /// action instead of BLOCK. Off by default since human-in-the-loop
    /// handling of an escalation is not wired up in this engine.
    pub escalate_on_critical: bool,
}

impl Default for ReviewerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strict_mode: false,
            model_tier_enabled: true,
            escalate_on_critical: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { log_level: "info".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub name: String,
    pub total_episodes: u32,
    pub reward_weights: RewardWeights,
    /// Exploration rate for this experiment's strategy table (§4.4). Part
    /// of the per-experiment config the Control API's `start` accepts, not
    /// a process-wide setting — two experiments may explore independently.
    pub epsilon: f32,
    pub enable_memory: bool,
    pub enable_evolution: bool,
    pub enable_defense: bool,
    pub episode_tick_ms: u64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            name: "experiment".to_string(),
            total_episodes: 100,
            reward_weights: RewardWeights::baseline(),
            epsilon: StrategyConfig::default().epsilon,
            enable_memory: true,
            enable_evolution: true,
            enable_defense: false,
            episode_tick_ms: 100,
        }
    }
}

impl ExperimentConfig {
    /// Validates invariants the runner depends on; called synchronously
    /// before an experiment is created (§7: configuration errors are
    /// surfaced at `start`, and the experiment is never created).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reward_weights.short_term < 0.0
            || self.reward_weights.long_term < 0.0
            || self.reward_weights.violation < 0.0
        {
            return Err(ConfigError::NegativeRewardWeight);
        }
        let weight_sum = (self.reward_weights.short_term
            + self.reward_weights.long_term
            + self.reward_weights.violation) as f64;
        if weight_sum <= 0.0 {
            return Err(ConfigError::NonPositiveWeightSum);
        }
        if !(0.0..=1.0).contains(&self.epsilon) {
            return Err(ConfigError::EpsilonOutOfRange(self.epsilon));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub memory: MemoryConfig,
    pub strategy: StrategyConfig,
    pub reviewer: ReviewerConfig,
    pub telemetry: TelemetryConfig,
    pub default_experiment: ExperimentConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("DRIFT_GATEWAY_API_KEY") {
            if !value.is_empty() {
                config.gateway.agent.api_key = value.clone();
                config.gateway.judge.api_key = value;
            }
        }
        if let Ok(value) = env::var("DRIFT_GATEWAY_BASE_URL") {
            if !value.is_empty() {
                config.gateway.agent.base_url = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}
