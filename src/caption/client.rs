use std::sync::Arc;
use std::time::Duration;

use super::provider::{create_provider, CaptionKind, CaptionProvider, CaptionResult};
use crate::config::{ProviderConfig, ProviderType};

/// Cheaply clonable handle to the configured captioning provider.
#[derive(Clone)]
pub struct CaptionClient {
    provider: Arc<dyn CaptionProvider>,
    provider_type: ProviderType,
    endpoint: String,
    api_key: Option<String>,
}

impl CaptionClient {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            provider: Arc::from(create_provider(config)),
            provider_type: config.provider,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.resolved_api_key(),
        }
    }

    pub fn provider(&self) -> Arc<dyn CaptionProvider> {
        Arc::clone(&self.provider)
    }

    /// Check that the provider's endpoint answers. Does not spend tokens.
    pub fn test_connection(&self) -> bool {
        if !self.provider.is_configured() {
            return false;
        }
        let url = match self.provider_type {
            ProviderType::OpenAI | ProviderType::LmStudio => format!("{}/models", self.endpoint),
            ProviderType::Ollama => format!("{}/api/tags", self.endpoint),
            // No free endpoint to call; a configured key is the best signal.
            ProviderType::Anthropic => return true,
        };

        let agent = ureq::AgentBuilder::new().timeout(Duration::from_secs(10)).build();
        let mut req = agent.get(&url);
        if let Some(ref key) = self.api_key {
            req = req.set("Authorization", &format!("Bearer {}", key));
        }
        match req.call() {
            Ok(response) => response.status() == 200,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Provider connection check failed");
                false
            }
        }
    }
}

impl CaptionProvider for CaptionClient {
    fn caption(&self, source_ref: &str, kind: CaptionKind) -> CaptionResult<String> {
        self.provider.caption(source_ref, kind)
    }

    fn provider_name(&self) -> &'static str {
        self.provider.provider_name()
    }

    fn is_configured(&self) -> bool {
        self.provider.is_configured()
    }
}
