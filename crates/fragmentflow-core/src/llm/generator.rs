//! Fragment generation: prompt a model for a structured `FragmentSpec`.
//!
//! Calls go through the `FallbackManager`, so a failing provider is
//! transparently replaced by the next one in its chain.

use std::sync::Arc;

use fragmentflow_types::fragment::FragmentSpec;
use fragmentflow_types::provider::{GenerationRequest, ModelTarget};
use serde_json::Value;

use super::fallback::{FallbackError, FallbackManager};
use super::invoker::ModelInvokerRegistry;
use crate::fragment::mapper::{builtin_templates, template};
use crate::sandbox::{SandboxError, validate_file_path};

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error(transparent)]
    Fallback(#[from] FallbackError),

    #[error("model output is not a valid fragment: {0}")]
    Parse(String),

    #[error("unsupported template: {0}")]
    UnsupportedTemplate(String),

    #[error("requested template '{expected}' but model chose '{actual}'")]
    TemplateMismatch { expected: String, actual: String },

    #[error(transparent)]
    InvalidPath(#[from] SandboxError),

    #[error("generated fragment has no code")]
    EmptyCode,
}

/// A fragment and the provider/model that produced it.
#[derive(Debug, Clone)]
pub struct GeneratedFragment {
    pub fragment: FragmentSpec,
    pub target: ModelTarget,
    pub failover_warning: Option<String>,
}

pub struct FragmentGenerator {
    fallback: Arc<FallbackManager>,
    invokers: Arc<ModelInvokerRegistry>,
}

impl FragmentGenerator {
    pub fn new(fallback: Arc<FallbackManager>, invokers: Arc<ModelInvokerRegistry>) -> Self {
        Self { fallback, invokers }
    }

    /// Generate a fragment for `prompt` on `target`, optionally pinned to a template.
    pub async fn generate(
        &self,
        target: &ModelTarget,
        prompt: &str,
        template_id: Option<&str>,
    ) -> Result<GeneratedFragment, GenerationError> {
        if let Some(id) = template_id {
            if template(id).is_none() {
                return Err(GenerationError::UnsupportedTemplate(id.to_string()));
            }
        }

        let request = GenerationRequest {
            prompt: prompt.to_string(),
            system: Some(system_prompt(template_id)),
            temperature: None,
            max_tokens: None,
        };
        let invokers = &self.invokers;
        let request = &request;
        let served = self
            .fallback
            .execute_with_fallback(target, |t| async move { invokers.generate(&t, request).await })
            .await?;

        let fragment = parse_fragment(served.value, template_id)?;
        tracing::info!(
            target = %served.target,
            template = %fragment.template,
            file_path = %fragment.file_path,
            "fragment generated"
        );
        Ok(GeneratedFragment {
            fragment,
            target: served.target,
            failover_warning: served.failover_warning,
        })
    }
}

fn system_prompt(template_id: Option<&str>) -> String {
    let mut prompt = String::from(
        "You generate a single runnable code fragment. Respond with one JSON object with the \
         fields: commentary, template, title, description, additional_dependencies, \
         install_dependencies_command, port (null when no port is exposed), file_path, code.\n\
         Available templates:\n",
    );
    for t in builtin_templates() {
        let port = t
            .default_port
            .map(|p| format!(", port {p}"))
            .unwrap_or_default();
        prompt.push_str(&format!(
            "- {} ({:?}, main file {}{port})\n",
            t.id, t.class, t.default_file_path
        ));
    }
    if let Some(id) = template_id {
        prompt.push_str(&format!("Use the template '{id}'.\n"));
    }
    prompt
}

/// Turn model output into a validated fragment.
///
/// Accepts a JSON object, or a string holding one (optionally wrapped in a
/// Markdown code fence).
pub fn parse_fragment(
    value: Value,
    expected_template: Option<&str>,
) -> Result<FragmentSpec, GenerationError> {
    let mut fragment: FragmentSpec = match value {
        Value::String(text) => serde_json::from_str(strip_fence(&text)),
        other => serde_json::from_value(other),
    }
    .map_err(|e| GenerationError::Parse(e.to_string()))?;

    let tpl = template(&fragment.template)
        .ok_or_else(|| GenerationError::UnsupportedTemplate(fragment.template.clone()))?;
    if let Some(expected) = expected_template {
        if expected != fragment.template {
            return Err(GenerationError::TemplateMismatch {
                expected: expected.to_string(),
                actual: fragment.template,
            });
        }
    }
    if fragment.code.trim().is_empty() {
        return Err(GenerationError::EmptyCode);
    }
    if fragment.file_path.trim().is_empty() {
        fragment.file_path = tpl.default_file_path;
    }
    validate_file_path(&fragment.file_path)?;
    Ok(fragment)
}

fn strip_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or(rest);
    body.strip_suffix("```").unwrap_or(body).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::health::ProviderHealthMonitor;
    use crate::llm::invoker::{BoxModelInvoker, ModelInvoker};
    use fragmentflow_types::config::{BreakerConfig, HealthConfig};
    use fragmentflow_types::provider::{FallbackConfig, ProviderError};
    use serde_json::json;
    use std::collections::HashMap;

    struct Canned {
        provider: &'static str,
        output: Result<Value, ProviderError>,
    }

    impl ModelInvoker for Canned {
        fn provider(&self) -> &str {
            self.provider
        }

        async fn generate(
            &self,
            _model: &str,
            request: &GenerationRequest,
        ) -> Result<Value, ProviderError> {
            assert!(request.system.as_deref().unwrap_or("").contains("code-interpreter-v1"));
            self.output.clone()
        }
    }

    fn fragment_json() -> Value {
        json!({
            "commentary": "plotting",
            "template": "code-interpreter-v1",
            "title": "Chart",
            "description": "Draws a chart",
            "additional_dependencies": ["matplotlib"],
            "has_additional_dependencies": true,
            "install_dependencies_command": "pip install matplotlib",
            "port": null,
            "file_path": "chart.py",
            "code": "print(1)"
        })
    }

    fn generator(invokers: Vec<Canned>, chains: Vec<FallbackConfig>) -> FragmentGenerator {
        let monitor = Arc::new(ProviderHealthMonitor::new(
            HealthConfig::default(),
            BreakerConfig::default(),
        ));
        let fallback = Arc::new(FallbackManager::new(monitor, chains).unwrap());
        let mut registry = ModelInvokerRegistry::new();
        for inv in invokers {
            registry.register(BoxModelInvoker::new(inv));
        }
        FragmentGenerator::new(fallback, Arc::new(registry))
    }

    #[tokio::test]
    async fn test_generate_parses_object() {
        let g = generator(
            vec![Canned {
                provider: "openai",
                output: Ok(fragment_json()),
            }],
            vec![],
        );
        let out = g
            .generate(&ModelTarget::new("openai", "gpt-4o"), "plot sales", None)
            .await
            .unwrap();
        assert_eq!(out.fragment.file_path, "chart.py");
        assert_eq!(out.fragment.additional_dependencies, vec!["matplotlib"]);
        assert!(out.failover_warning.is_none());
    }

    #[tokio::test]
    async fn test_generate_falls_back() {
        let chain = FallbackConfig {
            primary_provider: "openai".into(),
            fallback_providers: vec!["anthropic".into()],
            fallback_models: HashMap::new(),
            max_fallback_attempts: 1,
            fallback_delay_ms: 0,
        };
        let g = generator(
            vec![
                Canned {
                    provider: "openai",
                    output: Err(ProviderError::RateLimited {
                        retry_after_ms: None,
                    }),
                },
                Canned {
                    provider: "anthropic",
                    output: Ok(Value::String(format!("```json\n{}\n```", fragment_json()))),
                },
            ],
            vec![chain],
        );
        let out = g
            .generate(
                &ModelTarget::new("openai", "gpt-4o"),
                "plot sales",
                Some("code-interpreter-v1"),
            )
            .await
            .unwrap();
        assert_eq!(out.target, ModelTarget::new("anthropic", "claude-3-5-sonnet-latest"));
        assert!(out.failover_warning.is_some());
    }

    #[test]
    fn test_parse_fills_default_file_path() {
        let mut v = fragment_json();
        v["file_path"] = json!("");
        assert_eq!(parse_fragment(v, None).unwrap().file_path, "main.py");
    }

    #[test]
    fn test_parse_rejections() {
        let mut v = fragment_json();
        v["template"] = json!("php-developer");
        assert!(matches!(
            parse_fragment(v, None),
            Err(GenerationError::UnsupportedTemplate(_))
        ));

        assert!(matches!(
            parse_fragment(fragment_json(), Some("nextjs-developer")),
            Err(GenerationError::TemplateMismatch { .. })
        ));

        let mut v = fragment_json();
        v["file_path"] = json!("../escape.py");
        assert!(matches!(
            parse_fragment(v, None),
            Err(GenerationError::InvalidPath(_))
        ));

        let mut v = fragment_json();
        v["code"] = json!("   ");
        assert!(matches!(parse_fragment(v, None), Err(GenerationError::EmptyCode)));

        assert!(matches!(
            parse_fragment(json!("not json"), None),
            Err(GenerationError::Parse(_))
        ));
    }

    #[test]
    fn test_strip_fence() {
        assert_eq!(strip_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fence("  {\"a\":1} "), "{\"a\":1}");
    }
}
