//! Orchestrator configuration types.
//!
//! `OrchestratorConfig` represents the top-level `config.toml`. Every field
//! has a default, so an empty file (or no file) yields a working setup.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::provider::{FallbackConfig, default_fallback_configs};

/// Top-level configuration for the orchestration core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub health: HealthConfig,
    /// Fallback chains keyed by primary provider.
    #[serde(default = "default_fallback_configs")]
    pub fallback: Vec<FallbackConfig>,
    /// Per-provider model overrides for fallback substitution.
    #[serde(default)]
    pub default_models: HashMap<String, String>,
    /// OpenAI-compatible endpoints used for generation and health probes.
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderEndpoint>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            breaker: BreakerConfig::default(),
            health: HealthConfig::default(),
            fallback: default_fallback_configs(),
            default_models: HashMap::new(),
            providers: default_providers(),
        }
    }
}

impl OrchestratorConfig {
    /// Check cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executor.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "executor.max_concurrency must be > 0".to_string(),
            ));
        }
        if self.executor.workflow_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "executor.workflow_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "breaker.failure_threshold must be > 0".to_string(),
            ));
        }
        if self.health.unhealthy_after < self.health.degraded_after {
            return Err(ConfigError::Invalid(
                "health.unhealthy_after must be >= health.degraded_after".to_string(),
            ));
        }
        if self.health.probe_enabled && self.health.probe_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "health.probe_interval_secs must be > 0".to_string(),
            ));
        }
        for chain in &self.fallback {
            chain.validate()?;
        }
        Ok(())
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderEndpoint> {
        self.providers.iter().find(|p| p.name == name)
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Worker pool size: nodes of one execution running at the same time.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Per-attempt node timeout when the node does not set one.
    #[serde(default = "default_node_timeout_ms")]
    pub default_node_timeout_ms: u64,
    /// Upper bound for a whole execution.
    #[serde(default = "default_workflow_timeout_secs")]
    pub workflow_timeout_secs: u64,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_node_timeout_ms() -> u64 {
    300_000
}

fn default_workflow_timeout_secs() -> u64 {
    1800
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            default_node_timeout_ms: default_node_timeout_ms(),
            workflow_timeout_secs: default_workflow_timeout_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker & health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time the circuit stays open before a half-open trial.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    60_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Successful calls slower than this mark the provider degraded.
    #[serde(default = "default_slow_response_ms")]
    pub slow_response_ms: u64,
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,
    #[serde(default = "default_unhealthy_after")]
    pub unhealthy_after: u32,
    #[serde(default)]
    pub probe_enabled: bool,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_probe_providers")]
    pub probe_providers: Vec<String>,
}

fn default_slow_response_ms() -> u64 {
    5000
}

fn default_degraded_after() -> u32 {
    1
}

fn default_unhealthy_after() -> u32 {
    3
}

fn default_probe_interval_secs() -> u64 {
    300
}

fn default_probe_providers() -> Vec<String> {
    ["openai", "anthropic", "google", "vertex", "mistral", "groq"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            slow_response_ms: default_slow_response_ms(),
            degraded_after: default_degraded_after(),
            unhealthy_after: default_unhealthy_after(),
            probe_enabled: false,
            probe_interval_secs: default_probe_interval_secs(),
            probe_providers: default_probe_providers(),
        }
    }
}

// ---------------------------------------------------------------------------
// Provider endpoints
// ---------------------------------------------------------------------------

/// An OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    pub name: String,
    pub base_url: String,
    /// Environment variable holding the API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// URL probed by the health monitor (defaults to `{base_url}/models`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_url: Option<String>,
}

impl ProviderEndpoint {
    pub fn health_url(&self) -> String {
        self.health_url
            .clone()
            .unwrap_or_else(|| format!("{}/models", self.base_url.trim_end_matches('/')))
    }
}

fn default_providers() -> Vec<ProviderEndpoint> {
    [
        ("openai", "https://api.openai.com/v1", "OPENAI_API_KEY"),
        ("anthropic", "https://api.anthropic.com/v1", "ANTHROPIC_API_KEY"),
        (
            "google",
            "https://generativelanguage.googleapis.com/v1beta/openai",
            "GEMINI_API_KEY",
        ),
        ("mistral", "https://api.mistral.ai/v1", "MISTRAL_API_KEY"),
        ("groq", "https://api.groq.com/openai/v1", "GROQ_API_KEY"),
        ("xai", "https://api.x.ai/v1", "XAI_API_KEY"),
        ("deepseek", "https://api.deepseek.com/v1", "DEEPSEEK_API_KEY"),
    ]
    .into_iter()
    .map(|(name, base_url, key)| ProviderEndpoint {
        name: name.to_string(),
        base_url: base_url.to_string(),
        api_key_env: Some(key.to_string()),
        health_url: None,
    })
    .collect()
}
