//! HTTP health probe for configured provider endpoints.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};

use fragmentflow_core::llm::health::HealthProbe;
use fragmentflow_types::config::ProviderEndpoint;
use fragmentflow_types::provider::ProviderError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

struct ProbeTarget {
    url: String,
    api_key: Option<SecretString>,
}

/// Issues `GET {health_url}` per provider with the provider's bearer token.
///
/// Any 2xx response counts as healthy.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    targets: HashMap<String, ProbeTarget>,
}

impl HttpHealthProbe {
    pub fn new(endpoints: &[ProviderEndpoint]) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;
        let targets = endpoints
            .iter()
            .map(|ep| {
                let api_key = ep
                    .api_key_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok())
                    .filter(|k| !k.trim().is_empty())
                    .map(SecretString::from);
                (
                    ep.name.clone(),
                    ProbeTarget {
                        url: ep.health_url(),
                        api_key,
                    },
                )
            })
            .collect();
        Ok(Self { client, targets })
    }
}

impl HealthProbe for HttpHealthProbe {
    async fn check(&self, provider: &str) -> Result<(), ProviderError> {
        let target = self.targets.get(provider).ok_or_else(|| ProviderError::Provider {
            message: format!("no health endpoint configured for provider '{provider}'"),
        })?;

        let mut request = self.client.get(&target.url);
        if let Some(key) = &target.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(PROBE_TIMEOUT.as_millis() as u64)
            } else {
                ProviderError::Provider {
                    message: format!("health check request failed: {e}"),
                }
            }
        })?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(ProviderError::Authentication)
            }
            StatusCode::TOO_MANY_REQUESTS => Err(ProviderError::RateLimited {
                retry_after_ms: None,
            }),
            s => Err(ProviderError::Provider {
                message: format!("health check returned {s}"),
            }),
        }
    }
}
