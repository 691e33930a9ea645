//! Provider adapters for the quill session engine: a registry keyed by
//! `(provider, model)`, a deterministic mock for tests, and the retrying
//! stream wrapper the engine wires real adapters through.

pub mod mock;
pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use quill_core::provider::{LlmProvider, ModelRef, ProviderResolver};

pub use retry::{RetryConfig, RetryProvider};

/// Process-wide set of available provider adapters.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<ModelRef, Arc<dyn LlmProvider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provider: Arc<dyn LlmProvider>) {
        let model = provider.spec().model_ref();
        self.providers.write().insert(model, provider);
    }

    pub fn models(&self) -> Vec<ModelRef> {
        let mut models: Vec<ModelRef> = self.providers.read().keys().cloned().collect();
        models.sort_by(|a, b| {
            (a.provider_id.as_str(), a.model_id.as_str())
                .cmp(&(b.provider_id.as_str(), b.model_id.as_str()))
        });
        models
    }
}

impl ProviderResolver for ProviderRegistry {
    fn resolve(&self, model: &ModelRef) -> Option<Arc<dyn LlmProvider>> {
        self.providers.read().get(model).cloned()
    }
}

/// Placeholder adapter registered when no credentials are configured; every
/// stream attempt fails with an authentication error the engine records on
/// the assistant message.
pub struct NoAuthProvider {
    spec: quill_core::provider::ModelSpec,
}

impl NoAuthProvider {
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            spec: quill_core::provider::ModelSpec {
                provider_id: provider_id.into(),
                model_id: model_id.into(),
                context_limit: 0,
                output_limit: 0,
                cost: Default::default(),
            },
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for NoAuthProvider {
    fn spec(&self) -> &quill_core::provider::ModelSpec {
        &self.spec
    }

    async fn stream(
        &self,
        _request: &quill_core::provider::StreamRequest,
        _options: &quill_core::provider::StreamOptions,
    ) -> Result<quill_core::provider::ProviderStream, quill_core::provider::ProviderError> {
        Err(quill_core::provider::ProviderError::AuthFailed(format!(
            "no credentials configured for provider {}",
            self.spec.provider_id
        )))
    }
}
