//! Model provider types: health records, breaker state, fallback
//! configuration, generation requests, and the provider error taxonomy.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ConfigError;

/// Model used for a provider when no explicit substitute is configured.
pub fn default_model_for(provider: &str) -> &'static str {
    match provider {
        "openai" => "gpt-4o",
        "anthropic" => "claude-3-5-sonnet-latest",
        "google" => "models/gemini-2.0-flash",
        "vertex" => "gemini-2.0-flash-001",
        "mistral" => "mistral-large-latest",
        "groq" => "llama-3.3-70b-versatile",
        "xai" => "grok-beta",
        "deepseek" => "deepseek-chat",
        _ => "default-model",
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Derived health of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    CircuitOpen,
}

impl HealthStatus {
    /// Providers in this status are skipped by fallback chains.
    pub fn is_excluded(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy | HealthStatus::CircuitOpen)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::CircuitOpen => write!(f, "circuit_open"),
        }
    }
}

/// Health record for one provider, refreshed after every call outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider: String,
    pub status: HealthStatus,
    pub last_check: DateTime<Utc>,
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Latency of the most recent call in milliseconds.
    pub response_time_ms: u64,
    /// Fraction of successful calls over the record's lifetime (1.0 when unused).
    pub success_rate: f64,
    pub total_calls: u64,
    pub total_failures: u64,
}

impl ProviderHealth {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            status: HealthStatus::Healthy,
            last_check: Utc::now(),
            consecutive_failures: 0,
            last_error: None,
            response_time_ms: 0,
            success_rate: 1.0,
            total_calls: 0,
            total_failures: 0,
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

// ---------------------------------------------------------------------------
// Fallback configuration
// ---------------------------------------------------------------------------

/// Ordered fallback chain for one primary provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackConfig {
    pub primary_provider: String,
    /// Providers tried in order after the primary fails.
    pub fallback_providers: Vec<String>,
    /// Primary model id -> substitute model id.
    #[serde(default)]
    pub fallback_models: HashMap<String, String>,
    #[serde(default = "default_max_fallback_attempts")]
    pub max_fallback_attempts: u32,
    /// Base delay in milliseconds, multiplied by the attempt index.
    #[serde(default = "default_fallback_delay_ms")]
    pub fallback_delay_ms: u64,
}

fn default_max_fallback_attempts() -> u32 {
    2
}

fn default_fallback_delay_ms() -> u64 {
    1000
}

impl FallbackConfig {
    /// Reject configurations that could never produce a useful chain.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.primary_provider.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "primary_provider must not be empty".to_string(),
            ));
        }
        if self.fallback_providers.iter().any(|p| p.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "fallback chain for '{}' contains an empty provider name",
                self.primary_provider
            )));
        }
        if self.fallback_providers.contains(&self.primary_provider) {
            return Err(ConfigError::Invalid(format!(
                "fallback chain for '{}' lists the primary provider itself",
                self.primary_provider
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for p in &self.fallback_providers {
            if !seen.insert(p) {
                return Err(ConfigError::Invalid(format!(
                    "fallback chain for '{}' lists '{p}' twice",
                    self.primary_provider
                )));
            }
        }
        Ok(())
    }
}

/// Built-in fallback chains.
pub fn default_fallback_configs() -> Vec<FallbackConfig> {
    fn models(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    vec![
        FallbackConfig {
            primary_provider: "openai".to_string(),
            fallback_providers: vec![
                "anthropic".to_string(),
                "google".to_string(),
                "mistral".to_string(),
            ],
            fallback_models: models(&[
                ("gpt-4o", "claude-3-5-sonnet-latest"),
                ("gpt-4o-mini", "claude-3-5-haiku-latest"),
                ("gpt-4-turbo", "claude-3-5-sonnet-latest"),
            ]),
            max_fallback_attempts: default_max_fallback_attempts(),
            fallback_delay_ms: default_fallback_delay_ms(),
        },
        FallbackConfig {
            primary_provider: "anthropic".to_string(),
            fallback_providers: vec![
                "openai".to_string(),
                "google".to_string(),
                "mistral".to_string(),
            ],
            fallback_models: models(&[
                ("claude-3-5-sonnet-latest", "gpt-4o"),
                ("claude-3-5-haiku-latest", "gpt-4o-mini"),
            ]),
            max_fallback_attempts: default_max_fallback_attempts(),
            fallback_delay_ms: default_fallback_delay_ms(),
        },
        FallbackConfig {
            primary_provider: "google".to_string(),
            fallback_providers: vec![
                "openai".to_string(),
                "anthropic".to_string(),
                "mistral".to_string(),
            ],
            fallback_models: models(&[
                ("models/gemini-2.0-flash", "gpt-4o"),
                ("models/gemini-1.5-pro", "claude-3-5-sonnet-latest"),
            ]),
            max_fallback_attempts: default_max_fallback_attempts(),
            fallback_delay_ms: default_fallback_delay_ms(),
        },
    ]
}

// ---------------------------------------------------------------------------
// Model invocation
// ---------------------------------------------------------------------------

/// Provider/model pair a generation call is routed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelTarget {
    pub provider: String,
    pub model: String,
}

impl ModelTarget {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for ModelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// Prompt plus sampling parameters for a structured generation call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Failure of a single model provider call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("provider error: {message}")]
    Provider { message: String },

    #[error("rate limited (retry after {retry_after_ms:?}ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("authentication failed")]
    Authentication,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("circuit breaker is open for provider '{provider}'")]
    CircuitOpen { provider: String },
}

impl ProviderError {
    /// True for fast-fail signals that may succeed if tried again later.
    pub fn is_retryable_later(&self) -> bool {
        matches!(
            self,
            ProviderError::CircuitOpen { .. }
                | ProviderError::RateLimited { .. }
                | ProviderError::Timeout(_)
        )
    }
}
