//! Multi-provider fallback manager.
//!
//! Runs an operation against the primary provider through its breaker; on
//! failure walks the provider's configured fallback chain, skipping
//! providers the health monitor excludes and substituting an equivalent
//! model on each.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fragmentflow_types::config::OrchestratorConfig;
use fragmentflow_types::error::ConfigError;
use fragmentflow_types::provider::{
    FallbackConfig, ModelTarget, ProviderError, default_model_for,
};

use super::health::ProviderHealthMonitor;

/// Upper bound on a single provider call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum FallbackError {
    /// Every attempt in the chain failed or was skipped.
    #[error("all providers failed. last error: {last_error}")]
    Exhausted {
        attempts: u32,
        last_error: ProviderError,
    },

    /// The provider has no fallback chain and its single call failed.
    #[error(transparent)]
    Provider(ProviderError),

    #[error("invalid fallback configuration: {0}")]
    Invalid(#[from] ConfigError),
}

/// A successful call and the provider/model that served it.
#[derive(Debug)]
pub struct FallbackResult<T> {
    pub value: T,
    pub target: ModelTarget,
    /// Set when a provider other than the requested one answered.
    pub failover_warning: Option<String>,
}

pub struct FallbackManager {
    monitor: Arc<ProviderHealthMonitor>,
    configs: DashMap<String, FallbackConfig>,
    /// Per-provider model used when a chain has no explicit substitute.
    default_models: HashMap<String, String>,
    request_timeout: Duration,
}

impl FallbackManager {
    pub fn new(
        monitor: Arc<ProviderHealthMonitor>,
        configs: Vec<FallbackConfig>,
    ) -> Result<Self, FallbackError> {
        let manager = Self {
            monitor,
            configs: DashMap::new(),
            default_models: HashMap::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        };
        for config in configs {
            manager.set_fallback_config(config)?;
        }
        Ok(manager)
    }

    /// Build from the orchestrator config's `[[fallback]]` chains and
    /// `[default_models]` table.
    pub fn from_config(
        monitor: Arc<ProviderHealthMonitor>,
        config: &OrchestratorConfig,
    ) -> Result<Self, FallbackError> {
        let mut manager = Self::new(monitor, config.fallback.clone())?;
        manager.default_models = config.default_models.clone();
        Ok(manager)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Register or replace the chain for `config.primary_provider`.
    pub fn set_fallback_config(&self, config: FallbackConfig) -> Result<(), FallbackError> {
        config.validate()?;
        self.configs.insert(config.primary_provider.clone(), config);
        Ok(())
    }

    pub fn fallback_config(&self, provider: &str) -> Option<FallbackConfig> {
        self.configs.get(provider).map(|c| c.clone())
    }

    pub fn monitor(&self) -> &Arc<ProviderHealthMonitor> {
        &self.monitor
    }

    /// Model to run on `provider` in place of `primary_model`.
    fn substitute_model(&self, config: &FallbackConfig, primary_model: &str, provider: &str) -> String {
        config
            .fallback_models
            .get(primary_model)
            .or_else(|| self.default_models.get(provider))
            .cloned()
            .unwrap_or_else(|| default_model_for(provider).to_string())
    }

    /// Run `operation` on `primary`, falling back along its chain.
    ///
    /// Fallback provider `i` (0-based) is tried after `fallback_delay * i`.
    /// Skipped providers still use up one of the `max_fallback_attempts`
    /// slots.
    pub async fn execute_with_fallback<T, F, Fut>(
        &self,
        primary: &ModelTarget,
        operation: F,
    ) -> Result<FallbackResult<T>, FallbackError>
    where
        F: Fn(ModelTarget) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let Some(config) = self.fallback_config(&primary.provider) else {
            return self
                .attempt(primary, &operation)
                .await
                .map(|value| FallbackResult {
                    value,
                    target: primary.clone(),
                    failover_warning: None,
                })
                .map_err(FallbackError::Provider);
        };

        let mut last_error = match self.attempt(primary, &operation).await {
            Ok(value) => {
                return Ok(FallbackResult {
                    value,
                    target: primary.clone(),
                    failover_warning: None,
                });
            }
            Err(e) => {
                tracing::warn!(target = %primary, error = %e, "primary provider failed");
                e
            }
        };
        let mut attempts = 1;

        let limit = config
            .fallback_providers
            .len()
            .min(config.max_fallback_attempts as usize);
        for (i, provider) in config.fallback_providers.iter().take(limit).enumerate() {
            if self.monitor.is_excluded(provider) {
                tracing::warn!(provider = %provider, "skipping unhealthy fallback provider");
                continue;
            }
            if i > 0 {
                tokio::time::sleep(Duration::from_millis(config.fallback_delay_ms * i as u64)).await;
            }

            let target = ModelTarget::new(
                provider.clone(),
                self.substitute_model(&config, &primary.model, provider),
            );
            tracing::info!(from = %primary, to = %target, "attempting fallback");
            attempts += 1;

            match self.attempt(&target, &operation).await {
                Ok(value) => {
                    let warning = format!("{primary} failed, request served by {target}");
                    return Ok(FallbackResult {
                        value,
                        target,
                        failover_warning: Some(warning),
                    });
                }
                Err(e) => {
                    tracing::warn!(target = %target, error = %e, "fallback provider failed");
                    last_error = e;
                }
            }
        }

        tracing::error!(
            primary = %primary,
            attempts,
            error = %last_error,
            "all providers failed"
        );
        Err(FallbackError::Exhausted {
            attempts,
            last_error,
        })
    }

    /// One breaker-guarded, time-bounded call.
    async fn attempt<T, F, Fut>(&self, target: &ModelTarget, operation: &F) -> Result<T, ProviderError>
    where
        F: Fn(ModelTarget) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let timeout = self.request_timeout;
        self.monitor
            .call(&target.provider, || async move {
                match tokio::time::timeout(timeout, operation(target.clone())).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout(timeout.as_millis() as u64)),
                }
            })
            .await
    }
}
