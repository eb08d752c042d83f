use async_trait::async_trait;

use crate::models::{ChatCompletionParams, CompletionError};
use crate::sse_parser::new_sse_parser;
use crate::LlmStream;

/// Talks to a single OpenAI-compatible chat completion endpoint and streams
/// back tokens as they arrive.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat_completion_stream(
        &self,
        params: ChatCompletionParams,
    ) -> Result<LlmStream, CompletionError>;
}

#[derive(Debug, Clone)]
pub struct LlmClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_seconds: u64,
}

pub struct HttpLlmClient {
    config: LlmClientConfig,
    client: reqwest::Client,
}

impl HttpLlmClient {
    pub fn new(config: LlmClientConfig) -> Result<Self, CompletionError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| CompletionError::RequestFailed(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn chat_completion_stream(
        &self,
        mut params: ChatCompletionParams,
    ) -> Result<LlmStream, CompletionError> {
        params.stream = Some(true);

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&params)
            .send()
            .await
            .map_err(|e| CompletionError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::HttpError {
                status_code: status,
                message: crate::extract_error_message(&body),
            });
        }

        let byte_stream = response.bytes_stream();
        let parser = new_sse_parser(byte_stream);
        Ok(Box::pin(parser))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_strips_trailing_slash_from_base_url() {
        let client = HttpLlmClient::new(LlmClientConfig {
            base_url: "https://llm.internal/".to_string(),
            api_key: "key".to_string(),
            timeout_seconds: 30,
        })
        .unwrap();
        assert_eq!(client.endpoint(), "https://llm.internal/chat/completions");
    }
}
