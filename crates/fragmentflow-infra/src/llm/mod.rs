//! Provider adapters for the core's model seams.
//!
//! - [`openai_compat`]: `ModelInvoker` over any OpenAI-compatible endpoint
//! - [`probe`]: `HealthProbe` issuing HTTP GETs against provider endpoints
//!
//! [`build_invoker_registry`] turns the configured endpoints into a
//! [`ModelInvokerRegistry`], skipping providers without an API key.
//! [`build_fragment_generator`] wires that registry to a fallback manager
//! built from the same config.

pub mod openai_compat;
pub mod probe;

use std::sync::Arc;

use fragmentflow_core::llm::fallback::{FallbackError, FallbackManager};
use fragmentflow_core::llm::generator::FragmentGenerator;
use fragmentflow_core::llm::health::ProviderHealthMonitor;
use fragmentflow_core::llm::invoker::{BoxModelInvoker, ModelInvokerRegistry};
use fragmentflow_types::config::OrchestratorConfig;

use self::openai_compat::OpenAiCompatibleInvoker;
use self::openai_compat::config::OpenAiCompatConfig;

/// Register an invoker for every configured provider whose key is available.
pub fn build_invoker_registry(config: &OrchestratorConfig) -> ModelInvokerRegistry {
    let mut registry = ModelInvokerRegistry::new();
    for endpoint in &config.providers {
        match OpenAiCompatConfig::from_endpoint(endpoint) {
            Some(compat) => {
                registry.register(BoxModelInvoker::new(OpenAiCompatibleInvoker::new(compat)));
                tracing::debug!(provider = %endpoint.name, "model invoker registered");
            }
            None => {
                tracing::debug!(
                    provider = %endpoint.name,
                    env = endpoint.api_key_env.as_deref().unwrap_or(""),
                    "no API key, provider not registered"
                );
            }
        }
    }
    registry
}

/// Generator over the configured providers, their health monitor and
/// fallback chains.
///
/// The monitor is returned too so the caller can start its probe loop.
pub fn build_fragment_generator(
    config: &OrchestratorConfig,
) -> Result<(FragmentGenerator, Arc<ProviderHealthMonitor>), FallbackError> {
    let monitor = Arc::new(ProviderHealthMonitor::new(
        config.health.clone(),
        config.breaker.clone(),
    ));
    let fallback = FallbackManager::from_config(Arc::clone(&monitor), config)?;
    let generator = FragmentGenerator::new(
        Arc::new(fallback),
        Arc::new(build_invoker_registry(config)),
    );
    Ok((generator, monitor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fragmentflow_types::config::ProviderEndpoint;

    #[test]
    fn test_registry_skips_providers_without_keys() {
        let config = OrchestratorConfig {
            providers: vec![ProviderEndpoint {
                name: "local".into(),
                base_url: "http://localhost:11434/v1".into(),
                api_key_env: None,
                health_url: None,
            }],
            ..Default::default()
        };
        assert!(build_invoker_registry(&config).providers().is_empty());
    }

    #[test]
    fn test_generator_built_from_config() {
        let (_, monitor) = build_fragment_generator(&OrchestratorConfig::default()).unwrap();
        assert!(monitor.all_provider_health().is_empty());

        let mut config = OrchestratorConfig::default();
        config.fallback[0].fallback_providers.push("openai".into());
        assert!(matches!(
            build_fragment_generator(&config),
            Err(FallbackError::Invalid(_))
        ));
    }
}
