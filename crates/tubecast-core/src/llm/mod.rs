//! LLM provider abstraction for comment synthesis.
//!
//! One-shot chat completion behind a trait so tests can bind mocks and
//! other OpenAI-compatible endpoints slot in via configuration.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;

use crate::error::LlmError;

/// Parameters controlling LLM generation behavior.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    /// Maximum number of tokens to generate.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 50,
            temperature: 0.9,
        }
    }
}

/// Trait abstracting LLM provider operations.
///
/// Object-safe for use as `Arc<dyn LlmProvider>`.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Returns the display name of this provider (e.g., "openai").
    fn name(&self) -> &str;

    /// Send a single-message completion request, returning the text.
    async fn complete(
        &self,
        system: &str,
        user_message: &str,
        params: &GenerationParams,
    ) -> Result<String, LlmError>;
}

/// Build a provider from configuration, `None` when no API key is set.
pub fn provider_from_config(config: &crate::config::LlmConfig) -> Option<OpenAiCompatProvider> {
    if config.api_key.is_empty() {
        return None;
    }
    Some(OpenAiCompatProvider::new(
        config.base_url.clone(),
        config.api_key.clone(),
        config.model.clone(),
        config.provider.clone(),
    ))
}
