//! Connection settings for OpenAI-compatible providers.

use secrecy::SecretString;

use fragmentflow_types::config::ProviderEndpoint;

/// Settings for one [`super::OpenAiCompatibleInvoker`].
///
/// Does not derive Debug so the API key cannot end up in logs.
pub struct OpenAiCompatConfig {
    /// Provider id used for routing and health tracking (e.g. "groq").
    pub provider_name: String,
    /// Base URL for the API (e.g. "https://api.groq.com/openai/v1").
    pub base_url: String,
    pub api_key: SecretString,
}

impl OpenAiCompatConfig {
    pub fn new(provider_name: &str, base_url: &str, api_key: &str) -> Self {
        Self {
            provider_name: provider_name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: SecretString::from(api_key.to_string()),
        }
    }

    /// Build from a configured endpoint, reading the key from its env var.
    ///
    /// `None` when the endpoint names no env var or the var is unset/empty.
    pub fn from_endpoint(endpoint: &ProviderEndpoint) -> Option<Self> {
        let var = endpoint.api_key_env.as_deref()?;
        let key = std::env::var(var).ok().filter(|k| !k.trim().is_empty())?;
        Some(Self::new(&endpoint.name, &endpoint.base_url, &key))
    }
}
