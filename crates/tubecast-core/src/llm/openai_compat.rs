//! OpenAI-compatible LLM provider.
//!
//! Comment synthesis needs exactly one short completion per call, so the
//! provider speaks the minimal subset of the chat completions format:
//! one system message, one user message, first choice out. Any non-2xx
//! answer (rate limits included) is surfaced as an API error; the
//! composer falls back to the template pool rather than retrying.

use super::{GenerationParams, LlmProvider};
use crate::error::LlmError;

/// An LLM provider using the OpenAI chat completions API format.
///
/// Compatible with OpenAI and any endpoint sharing the format.
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    provider_name: String,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(base_url: String, api_key: String, model: String, provider_name: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
            model,
            provider_name,
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    async fn complete(
        &self,
        system: &str,
        user_message: &str,
        params: &GenerationParams,
    ) -> Result<String, LlmError> {
        let request = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user_message },
            ],
            "max_tokens": params.max_tokens,
            "temperature": params.temperature,
        });

        tracing::debug!(
            provider = %self.provider_name,
            model = %self.model,
            max_tokens = params.max_tokens,
            "LLM request",
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        if !(200..300).contains(&status) {
            return Err(LlmError::Api {
                status,
                message: body,
            });
        }

        let parsed: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| LlmError::Parse(format!("completion is not JSON: {e}")))?;
        let text = parsed
            .pointer("/choices/0/message/content")
            .and_then(serde_json::Value::as_str)
            .map(str::trim)
            .unwrap_or_default();

        if text.is_empty() {
            return Err(LlmError::Parse("completion carried no text".to_string()));
        }

        tracing::debug!(chars = text.len(), "LLM response");
        Ok(text.to_string())
    }
}
