//! Model invocation seam.
//!
//! `ModelInvoker` is the RPITIT trait implemented per provider backend.
//! `BoxModelInvoker` erases it for runtime selection:
//! 1. `ModelInvokerDyn` is an object-safe twin with boxed futures
//! 2. a blanket impl covers every `T: ModelInvoker`
//! 3. `BoxModelInvoker` wraps `Box<dyn ModelInvokerDyn>` and delegates

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use fragmentflow_types::provider::{GenerationRequest, ModelTarget, ProviderError};
use serde_json::Value;

/// Generates a structured (JSON) result from a prompt.
pub trait ModelInvoker: Send + Sync {
    /// Provider id this invoker serves (e.g. "openai").
    fn provider(&self) -> &str;

    fn generate(
        &self,
        model: &str,
        request: &GenerationRequest,
    ) -> impl Future<Output = Result<Value, ProviderError>> + Send;
}

/// Object-safe version of [`ModelInvoker`].
pub trait ModelInvokerDyn: Send + Sync {
    fn provider(&self) -> &str;

    fn generate_boxed<'a>(
        &'a self,
        model: &'a str,
        request: &'a GenerationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ProviderError>> + Send + 'a>>;
}

impl<T: ModelInvoker> ModelInvokerDyn for T {
    fn provider(&self) -> &str {
        ModelInvoker::provider(self)
    }

    fn generate_boxed<'a>(
        &'a self,
        model: &'a str,
        request: &'a GenerationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ProviderError>> + Send + 'a>> {
        Box::pin(self.generate(model, request))
    }
}

/// Type-erased model invoker.
pub struct BoxModelInvoker {
    inner: Box<dyn ModelInvokerDyn>,
}

impl BoxModelInvoker {
    pub fn new<T: ModelInvoker + 'static>(invoker: T) -> Self {
        Self {
            inner: Box::new(invoker),
        }
    }

    pub fn provider(&self) -> &str {
        self.inner.provider()
    }

    pub async fn generate(
        &self,
        model: &str,
        request: &GenerationRequest,
    ) -> Result<Value, ProviderError> {
        self.inner.generate_boxed(model, request).await
    }
}

/// Invokers indexed by provider id.
#[derive(Default)]
pub struct ModelInvokerRegistry {
    invokers: HashMap<String, BoxModelInvoker>,
}

impl ModelInvokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the invoker's own provider id, replacing any previous one.
    pub fn register(&mut self, invoker: BoxModelInvoker) {
        self.invokers.insert(invoker.provider().to_string(), invoker);
    }

    pub fn get(&self, provider: &str) -> Option<&BoxModelInvoker> {
        self.invokers.get(provider)
    }

    pub fn providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.invokers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Route a request to the invoker for `target.provider`.
    pub async fn generate(
        &self,
        target: &ModelTarget,
        request: &GenerationRequest,
    ) -> Result<Value, ProviderError> {
        let invoker = self.get(&target.provider).ok_or_else(|| ProviderError::Provider {
            message: format!("no invoker registered for provider '{}'", target.provider),
        })?;
        invoker.generate(&target.model, request).await
    }
}
