//! OpenAI-compatible model invoker.
//!
//! A single [`OpenAiCompatibleInvoker`] serves every provider that speaks the
//! OpenAI chat completions protocol (OpenAI, Anthropic's compatibility
//! endpoint, Gemini, Mistral, Groq, xAI, DeepSeek) through a configurable
//! base URL.
//!
//! Uses [`async_openai`] for type-safe request/response handling.

pub mod config;

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessage,
    ChatCompletionRequestUserMessageContent, CreateChatCompletionRequest,
};
use secrecy::ExposeSecret;
use serde_json::Value;

use fragmentflow_core::llm::invoker::ModelInvoker;
use fragmentflow_types::provider::{GenerationRequest, ProviderError};

use self::config::OpenAiCompatConfig;

/// Chat-completions backed [`ModelInvoker`].
///
/// Returns the first choice's content as a JSON string value; parsing into a
/// fragment happens in the core generator.
pub struct OpenAiCompatibleInvoker {
    client: Client<OpenAIConfig>,
    provider_name: String,
}

impl OpenAiCompatibleInvoker {
    pub fn new(config: OpenAiCompatConfig) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(config.api_key.expose_secret())
            .with_api_base(&config.base_url);

        Self {
            client: Client::with_config(openai_config),
            provider_name: config.provider_name,
        }
    }

    fn build_request(&self, model: &str, request: &GenerationRequest) -> CreateChatCompletionRequest {
        let mut messages: Vec<ChatCompletionRequestMessage> = Vec::new();

        if let Some(ref system) = request.system {
            messages.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessage {
                    content: ChatCompletionRequestSystemMessageContent::Text(system.clone()),
                    name: None,
                },
            ));
        }
        messages.push(ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessage {
                content: ChatCompletionRequestUserMessageContent::Text(request.prompt.clone()),
                name: None,
            },
        ));

        CreateChatCompletionRequest {
            model: model.to_string(),
            messages,
            max_completion_tokens: request.max_tokens,
            temperature: request.temperature,
            ..Default::default()
        }
    }
}

impl ModelInvoker for OpenAiCompatibleInvoker {
    fn provider(&self) -> &str {
        &self.provider_name
    }

    async fn generate(
        &self,
        model: &str,
        request: &GenerationRequest,
    ) -> Result<Value, ProviderError> {
        let oai_request = self.build_request(model, request);

        let response = self
            .client
            .chat()
            .create(oai_request)
            .await
            .map_err(map_openai_error)?;

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                ProviderError::InvalidResponse(format!(
                    "{} returned no content for model {model}",
                    self.provider_name
                ))
            })?;

        tracing::debug!(
            provider = %self.provider_name,
            model = %response.model,
            chars = content.len(),
            "generation response received"
        );
        Ok(Value::String(content))
    }
}

/// Map an `async_openai::error::OpenAIError` to a [`ProviderError`].
fn map_openai_error(err: async_openai::error::OpenAIError) -> ProviderError {
    use async_openai::error::OpenAIError;

    match &err {
        OpenAIError::ApiError(api_err) => {
            let code = api_err.code.as_deref().unwrap_or("");
            let error_type = api_err.r#type.as_deref().unwrap_or("");

            if code == "authentication_error"
                || error_type == "authentication_error"
                || api_err.message.contains("Incorrect API key")
                || api_err.message.contains("Invalid API key")
            {
                ProviderError::Authentication
            } else if code == "rate_limit_exceeded" || error_type == "rate_limit_error" {
                ProviderError::RateLimited {
                    retry_after_ms: None,
                }
            } else {
                ProviderError::Provider {
                    message: err.to_string(),
                }
            }
        }
        OpenAIError::Reqwest(reqwest_err) => {
            match reqwest_err.status().map(|s| s.as_u16()) {
                Some(401) | Some(403) => ProviderError::Authentication,
                Some(429) => ProviderError::RateLimited {
                    retry_after_ms: None,
                },
                _ => ProviderError::Provider {
                    message: err.to_string(),
                },
            }
        }
        OpenAIError::JSONDeserialize(_, content) => {
            ProviderError::InvalidResponse(format!("failed to parse response: {content}"))
        }
        _ => ProviderError::Provider {
            message: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invoker() -> OpenAiCompatibleInvoker {
        OpenAiCompatibleInvoker::new(OpenAiCompatConfig::new(
            "groq",
            "https://api.groq.com/openai/v1",
            "gsk-test",
        ))
    }

    #[test]
    fn test_provider_name() {
        assert_eq!(invoker().provider(), "groq");
    }

    #[test]
    fn test_build_request_with_system() {
        let request = GenerationRequest {
            prompt: "plot sales".into(),
            system: Some("respond with json".into()),
            temperature: Some(0.2),
            max_tokens: Some(2048),
        };
        let req = invoker().build_request("llama-3.3-70b-versatile", &request);
        assert_eq!(req.model, "llama-3.3-70b-versatile");
        assert_eq!(req.messages.len(), 2);
        assert!(matches!(req.messages[0], ChatCompletionRequestMessage::System(_)));
        assert!(matches!(req.messages[1], ChatCompletionRequestMessage::User(_)));
        assert_eq!(req.max_completion_tokens, Some(2048));
        assert_eq!(req.temperature, Some(0.2));
    }

    #[test]
    fn test_build_request_without_system() {
        let request = GenerationRequest {
            prompt: "hello".into(),
            ..Default::default()
        };
        let req = invoker().build_request("m", &request);
        assert_eq!(req.messages.len(), 1);
        assert!(req.max_completion_tokens.is_none());
    }

    #[test]
    fn test_map_invalid_argument() {
        let err = async_openai::error::OpenAIError::InvalidArgument("bad".into());
        assert!(matches!(
            map_openai_error(err),
            ProviderError::Provider { .. }
        ));
    }
}
